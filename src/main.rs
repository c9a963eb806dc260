#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    firmware::run()
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    dry_run::run()
}

#[cfg(target_os = "espidf")]
mod firmware {
    use anyhow::Result;
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::prelude::Peripherals;
    use esp_idf_sys as _; // Binstart
    use log::{error, info};

    use esp32_sd_flasher::esp::{self, EspPlatform, SdCardMedia};
    use esp32_sd_flasher::{logging, version, BootOrchestrator, FlasherConfig};

    // Generate ESP-IDF app descriptor
    #[allow(unexpected_cfgs)]
    mod app_desc {
        esp_idf_sys::esp_app_desc!();
    }

    pub fn run() -> Result<()> {
        esp_idf_svc::sys::link_patches();

        let config = FlasherConfig::default();
        logging::init_logger(&config.log_level)
            .map_err(|e| anyhow::anyhow!("logger init failed: {}", e))?;
        info!("SD flasher {}", version::full_version());

        let peripherals = Peripherals::take()?;
        let mut platform = EspPlatform::new();
        let mut media = SdCardMedia::new(peripherals.spi3, config.sd.clone());

        let outcome = BootOrchestrator::new(&mut platform, &mut media, config).run();
        match outcome {
            Ok(reason) => {
                info!("Restarting: {}", reason.description());
                drop(platform);
                esp::restart();
            }
            Err(e) => {
                error!("Flasher stopped ({:?} error): {}", e.class(), e);
                error!("Device halted; fix the SD card or flash layout and power cycle");
                loop {
                    FreeRtos::delay_ms(10_000);
                    error!("Halted: {}", e);
                }
            }
        }
    }
}

#[cfg(not(target_os = "espidf"))]
mod dry_run {
    use std::path::PathBuf;

    use anyhow::{bail, Context, Result};
    use clap::{Parser, ValueEnum};
    use log::{error, info, warn};

    use esp32_sd_flasher::media::DirectoryMedia;
    use esp32_sd_flasher::partition::app_desc::read_app_descriptor;
    use esp32_sd_flasher::partition::{
        PartitionTable, ALTERNATE_SLOT_ADDRESS, PRIMARY_SLOT_ADDRESS,
    };
    use esp32_sd_flasher::platform::FlashPlatform;
    use esp32_sd_flasher::sim::{fake_app_image, SimDevice};
    use esp32_sd_flasher::{logging, version, BootOrchestrator, FlasherConfig, RestartReason};

    const FLASH_SIZE: usize = 0x400000;
    const FLASHER_IMAGE_LEN: usize = 0x8000;

    #[derive(Debug, Clone, Copy, ValueEnum)]
    enum Slot {
        Primary,
        Alternate,
    }

    /// Simulate the flasher's boot cycles against an SD card directory
    #[derive(Parser, Debug)]
    #[command(name = "esp32-sd-flasher", version = version::VERSION)]
    struct Args {
        /// Directory standing in for the SD card root
        #[arg(long)]
        sd_dir: PathBuf,

        /// Slot the flasher starts in
        #[arg(long, value_enum, default_value = "primary")]
        running: Slot,

        /// Give up after this many boots
        #[arg(long, default_value_t = 6)]
        max_boots: u32,

        /// Log level (error, warn, info, debug, trace)
        #[arg(long, default_value = "info")]
        log_level: String,
    }

    pub fn run() -> Result<()> {
        let args = Args::parse();
        logging::init_logger(&args.log_level)
            .map_err(|e| anyhow::anyhow!("logger init failed: {}", e))?;

        let running = match args.running {
            Slot::Primary => PRIMARY_SLOT_ADDRESS,
            Slot::Alternate => ALTERNATE_SLOT_ADDRESS,
        };
        let mut device = SimDevice::new(FLASH_SIZE, &PartitionTable::sd_flasher_layout(), running);
        device.load(
            running,
            &fake_app_image("sd-flasher", version::VERSION, FLASHER_IMAGE_LEN, 0),
        );
        let mut media = DirectoryMedia::new(&args.sd_dir);

        for boot in 1..=args.max_boots {
            info!("--- boot {} ---", boot);
            let outcome = BootOrchestrator::new(&mut device, &mut media, FlasherConfig::default()).run();
            match outcome {
                Ok(RestartReason::ImageFlashed) => {
                    device.restart();
                    let app = device.running_partition().context("no running partition")?;
                    match read_app_descriptor(&mut device, &app)? {
                        Some(desc) => info!("Device would now boot '{}' {} from {}", desc.project_name, desc.version, app),
                        None => warn!("Device would now boot {} without an app descriptor", app),
                    }
                    return Ok(());
                }
                Ok(reason) => {
                    info!("Restarting: {}", reason.description());
                    device.restart();
                }
                Err(e) => {
                    error!("Flasher stopped ({:?} error): {}", e.class(), e);
                    return Err(e.into());
                }
            }
        }
        bail!("no image flashed after {} boots", args.max_boots)
    }
}
