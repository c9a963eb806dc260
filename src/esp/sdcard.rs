// SD card over SPI, mounted as FAT through the VFS

use std::fs::File;
use std::io;
use std::path::PathBuf;

use esp_idf_hal::gpio::AnyIOPin;
use esp_idf_hal::sd::spi::SdSpiHostDriver;
use esp_idf_hal::sd::{SdCardConfiguration, SdCardDriver};
use esp_idf_hal::spi::config::DriverConfig;
use esp_idf_hal::spi::{Dma, SpiDriver, SPI3};
use esp_idf_svc::fs::fatfs::Fatfs;
use esp_idf_svc::io::vfs::MountedFatfs;
use log::info;

use crate::config::SdCardConfig;
use crate::platform::RemovableMedia;

type SdCard = SdCardDriver<SdSpiHostDriver<'static, SpiDriver<'static>>>;

/// SD card slot of the board. The SPI bus is consumed by the first mount,
/// so the card can be mounted once per boot.
pub struct SdCardMedia {
    spi: Option<SPI3>,
    config: SdCardConfig,
    mounted: Option<MountedFatfs<Fatfs<SdCard>>>,
}

impl SdCardMedia {
    pub fn new(spi: SPI3, config: SdCardConfig) -> Self {
        Self {
            spi: Some(spi),
            config,
            mounted: None,
        }
    }

    fn driver(&mut self) -> io::Result<SdCard> {
        let spi = self
            .spi
            .take()
            .ok_or_else(|| io::Error::other("SD card SPI bus already used this boot"))?;
        let pins = self.config.pins;

        // Pin numbers come from the configuration instead of typed pins
        let (clk, mosi, miso, cs) = unsafe {
            (
                AnyIOPin::new(pins.clk),
                AnyIOPin::new(pins.mosi),
                AnyIOPin::new(pins.miso),
                AnyIOPin::new(pins.cs),
            )
        };

        let spi_driver = SpiDriver::new(
            spi,
            clk,
            mosi,
            Some(miso),
            &DriverConfig::default().dma(Dma::Auto(self.config.max_transfer_size)),
        )
        .map_err(io::Error::other)?;

        let host = SdSpiHostDriver::new(
            spi_driver,
            Some(cs),
            AnyIOPin::none(),
            AnyIOPin::none(),
            AnyIOPin::none(),
            None,
        )
        .map_err(io::Error::other)?;

        SdCardDriver::new_spi(host, &SdCardConfiguration::new()).map_err(io::Error::other)
    }
}

impl RemovableMedia for SdCardMedia {
    type File = File;

    fn mount(&mut self) -> io::Result<()> {
        if self.mounted.is_some() {
            return Ok(());
        }
        let card = self.driver()?;
        let fatfs = Fatfs::new_sdcard(0, card).map_err(io::Error::other)?;
        let mounted = MountedFatfs::mount(fatfs, &self.config.mount_point, self.config.max_files as usize)
            .map_err(io::Error::other)?;
        // Never formatted here, so there is no allocation unit to pass
        info!(
            "SD card mounted at {} (max files {})",
            self.config.mount_point, self.config.max_files
        );
        self.mounted = Some(mounted);
        Ok(())
    }

    fn open(&mut self, path: &str) -> io::Result<Option<(File, u64)>> {
        if self.mounted.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "SD card not mounted"));
        }
        let full = PathBuf::from(&self.config.mount_point).join(path);
        match File::open(&full) {
            Ok(file) => {
                let len = file.metadata()?.len();
                Ok(Some((file, len)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn unmount(&mut self) -> io::Result<()> {
        // Dropping the mount unregisters the VFS path and frees the card
        if self.mounted.take().is_some() {
            info!("SD card unmounted");
        }
        Ok(())
    }
}
