// ESP-IDF implementations of the platform traits

mod flash;
mod sdcard;

pub use flash::EspPlatform;
pub use sdcard::SdCardMedia;

use crate::error::FlashError;

/// Map an `esp_err_t` to a typed error
fn check(op: &'static str, code: esp_idf_sys::esp_err_t) -> Result<(), FlashError> {
    if code == esp_idf_sys::ESP_OK as esp_idf_sys::esp_err_t {
        Ok(())
    } else {
        Err(FlashError::Platform { op, code })
    }
}

/// Restart into whatever the boot pointer selects
pub fn restart() -> ! {
    log::logger().flush();
    esp_idf_hal::delay::FreeRtos::delay_ms(100);
    unsafe { esp_idf_sys::esp_restart() }
}
