use std::env;
use std::error::Error;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use fatvol::config::DEFAULT_VOLUME_ID;
use fatvol::{shared, DeviceRegistry, FatCode, ImageDevice, OpenFlags, VfsError, Volume};

const IMAGE_PATH: &str = "fat_smoke.img";
const IMAGE_SECTORS: u64 = 8192;
const PAYLOAD: &[u8] = b"Hello.... World?\n";

fn run(path: &str) -> Result<(), Box<dyn Error>> {
    let image = if Path::new(path).exists() {
        ImageDevice::open(path)?
    } else {
        ImageDevice::create(path, IMAGE_SECTORS)?
    };
    let device = shared(image);
    let volume = Volume::new(DEFAULT_VOLUME_ID, DeviceRegistry::new());
    match volume.mount(Arc::clone(&device)) {
        Ok(()) => {}
        Err(VfsError::Fat(FatCode::NoFilesystem)) => {
            println!("fat-smoke: formatting {path}");
            volume.format(Arc::clone(&device))?;
            volume.mount(device)?;
        }
        Err(err) => return Err(err.into()),
    }

    let flags = OpenFlags::WRONLY | OpenFlags::CREATE | OpenFlags::TRUNC;
    let mut file = volume.open_file("/hello.txt", flags, 0o644)?;
    file.write(PAYLOAD)?;
    file.close()?;

    let mut file = volume.open("/hello.txt")?;
    let mut buf = [0u8; 512];
    let read = file.read(&mut buf)?;
    if &buf[..read] != PAYLOAD {
        return Err("payload mismatch".into());
    }
    file.close()?;

    let mut root = volume.open("/")?;
    for entry in root.readdir(0)? {
        let suffix = if entry.is_dir() { "/" } else { "" };
        println!("{:>10} {}{}", entry.size, entry.name, suffix);
    }
    root.close()?;
    volume.unmount()?;
    Ok(())
}

fn main() -> ExitCode {
    let path = env::args().nth(1).unwrap_or_else(|| IMAGE_PATH.into());
    match run(&path) {
        Ok(()) => {
            println!("fat-smoke: ok");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("fat-smoke: fail: {err}");
            ExitCode::FAILURE
        }
    }
}
