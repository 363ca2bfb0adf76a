//! Lists every mounted USB mass storage volume, then keeps watching for
//! hotplug changes until interrupted.

use color_eyre::Result;
use tracing::{info, level_filters::LevelFilter};
use umsfs::{HostFlags, UmsHost};

fn print_mounts(host: &UmsHost) {
    let devices = host.list_mounted_devices();
    if devices.is_empty() {
        println!("no mounted volumes");
        return;
    }
    for device in devices {
        println!(
            "{}: {} {} (lun {}, partition {}, {}, {} bytes{})",
            device.name,
            device.vendor,
            device.product,
            device.lun_index,
            device.partition_index,
            device.fs,
            device.capacity_bytes,
            if device.write_protect { ", write-protected" } else { "" },
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .without_time()
        .init();

    info!("starting");
    let host = UmsHost::init(HostFlags::empty()).await?;
    print_mounts(&host);

    let mut status = host.status_events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                print_mounts(&host);
            }
        }
    }

    host.exit().await;
    Ok(())
}
