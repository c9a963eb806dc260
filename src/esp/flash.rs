// Flash, partition and OTA primitives over the ESP-IDF C API

use core::ffi::c_void;
use std::ffi::{CStr, CString};

use esp_idf_sys::{
    esp_flash_erase_region, esp_flash_read, esp_flash_write, esp_ota_abort, esp_ota_begin,
    esp_ota_end, esp_ota_get_running_partition, esp_ota_handle_t,
    esp_ota_mark_app_valid_cancel_rollback, esp_ota_set_boot_partition, esp_ota_write,
    esp_partition_erase_range, esp_partition_find_first, esp_partition_read, esp_partition_t,
    esp_partition_write, esp_reset_reason,
};

use super::check;
use crate::error::FlashError;
use crate::partition::{Partition, PartitionKind, PartitionSubtype};
use crate::platform::{FlashPlatform, ResetReason};

/// The chip's own flash through `esp_partition_*`, `esp_flash_*` and
/// `esp_ota_*`
pub struct EspPlatform {
    ota_handle: Option<esp_ota_handle_t>,
}

impl EspPlatform {
    pub fn new() -> Self {
        Self { ota_handle: None }
    }

    /// Look `partition` up again in the live table
    fn raw(&self, partition: &Partition) -> Result<*const esp_partition_t, FlashError> {
        let label = CString::new(partition.label.as_str())
            .map_err(|_| FlashError::UnknownPartition(partition.label.clone()))?;
        let raw = unsafe {
            esp_partition_find_first(
                partition.kind.raw() as _,
                partition.subtype.raw() as _,
                label.as_ptr(),
            )
        };
        match unsafe { raw.as_ref() } {
            Some(p) if p.address == partition.address && p.size == partition.size => Ok(raw),
            _ => Err(FlashError::UnknownPartition(partition.label.clone())),
        }
    }
}

impl Default for EspPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn from_raw(raw: &esp_partition_t) -> Partition {
    let kind = PartitionKind::from_raw(raw.type_ as u8);
    let label = unsafe { CStr::from_ptr(raw.label.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    let mut flags = 0;
    if raw.encrypted {
        flags |= 0x01;
    }
    if raw.readonly {
        flags |= 0x02;
    }
    Partition {
        label,
        kind,
        subtype: PartitionSubtype::from_raw(kind, raw.subtype as u8),
        address: raw.address,
        size: raw.size,
        flags,
    }
}

impl FlashPlatform for EspPlatform {
    fn running_partition(&mut self) -> Result<Partition, FlashError> {
        let raw = unsafe { esp_ota_get_running_partition() };
        unsafe { raw.as_ref() }
            .map(from_raw)
            .ok_or_else(|| FlashError::UnknownPartition("running".to_string()))
    }

    fn find_partition(
        &mut self,
        kind: PartitionKind,
        subtype: PartitionSubtype,
        label: Option<&str>,
    ) -> Option<Partition> {
        let label = match label {
            Some(l) => Some(CString::new(l).ok()?),
            None => None,
        };
        let raw = unsafe {
            esp_partition_find_first(
                kind.raw() as _,
                subtype.raw() as _,
                label.as_ref().map_or(core::ptr::null(), |l| l.as_ptr()),
            )
        };
        unsafe { raw.as_ref() }.map(from_raw)
    }

    fn erase_range(&mut self, partition: &Partition, offset: u32, len: u32) -> Result<(), FlashError> {
        let raw = self.raw(partition)?;
        check("esp_partition_erase_range", unsafe {
            esp_partition_erase_range(raw, offset as _, len as _)
        })
    }

    fn read(&mut self, partition: &Partition, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let raw = self.raw(partition)?;
        check("esp_partition_read", unsafe {
            esp_partition_read(raw, offset as _, buf.as_mut_ptr() as *mut c_void, buf.len() as _)
        })
    }

    fn write(&mut self, partition: &Partition, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let raw = self.raw(partition)?;
        check("esp_partition_write", unsafe {
            esp_partition_write(raw, offset as _, data.as_ptr() as *const c_void, data.len() as _)
        })
    }

    // Region calls go to the default chip (null) and need
    // CONFIG_SPI_FLASH_DANGEROUS_WRITE_ALLOWED for the table sector
    fn erase_region(&mut self, address: u32, len: u32) -> Result<(), FlashError> {
        check("esp_flash_erase_region", unsafe {
            esp_flash_erase_region(core::ptr::null_mut(), address, len)
        })
    }

    fn read_region(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        check("esp_flash_read", unsafe {
            esp_flash_read(
                core::ptr::null_mut(),
                buf.as_mut_ptr() as *mut c_void,
                address,
                buf.len() as u32,
            )
        })
    }

    fn write_region(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        check("esp_flash_write", unsafe {
            esp_flash_write(
                core::ptr::null_mut(),
                data.as_ptr() as *const c_void,
                address,
                data.len() as u32,
            )
        })
    }

    fn set_boot_partition(&mut self, partition: &Partition) -> Result<(), FlashError> {
        let raw = self.raw(partition)?;
        check("esp_ota_set_boot_partition", unsafe { esp_ota_set_boot_partition(raw) })
    }

    fn begin_image_write(&mut self, partition: &Partition, image_len: u64) -> Result<(), FlashError> {
        let raw = self.raw(partition)?;
        if let Some(handle) = self.ota_handle.take() {
            unsafe { esp_ota_abort(handle) };
        }
        let mut handle: esp_ota_handle_t = 0;
        check("esp_ota_begin", unsafe {
            esp_ota_begin(raw, image_len as _, &mut handle as *mut _)
        })?;
        self.ota_handle = Some(handle);
        Ok(())
    }

    fn write_image_chunk(&mut self, data: &[u8]) -> Result<(), FlashError> {
        let handle = self.ota_handle.ok_or(FlashError::NoImageWrite)?;
        check("esp_ota_write", unsafe {
            esp_ota_write(handle, data.as_ptr() as *const c_void, data.len() as _)
        })
    }

    fn end_image_write(&mut self) -> Result<(), FlashError> {
        // esp_ota_end frees the handle even when validation fails
        let handle = self.ota_handle.take().ok_or(FlashError::NoImageWrite)?;
        check("esp_ota_end", unsafe { esp_ota_end(handle) })
    }

    fn abort_image_write(&mut self) {
        if let Some(handle) = self.ota_handle.take() {
            unsafe { esp_ota_abort(handle) };
        }
    }

    fn mark_running_valid(&mut self) -> Result<(), FlashError> {
        check("esp_ota_mark_app_valid_cancel_rollback", unsafe {
            esp_ota_mark_app_valid_cancel_rollback()
        })
    }

    #[allow(non_upper_case_globals)]
    fn reset_reason(&self) -> ResetReason {
        use esp_idf_sys::*;

        match unsafe { esp_reset_reason() } {
            esp_reset_reason_t_ESP_RST_POWERON => ResetReason::PowerOn,
            esp_reset_reason_t_ESP_RST_EXT => ResetReason::External,
            esp_reset_reason_t_ESP_RST_SW => ResetReason::Software,
            esp_reset_reason_t_ESP_RST_PANIC => ResetReason::Panic,
            esp_reset_reason_t_ESP_RST_INT_WDT => ResetReason::InterruptWatchdog,
            esp_reset_reason_t_ESP_RST_TASK_WDT => ResetReason::TaskWatchdog,
            esp_reset_reason_t_ESP_RST_WDT => ResetReason::OtherWatchdog,
            esp_reset_reason_t_ESP_RST_DEEPSLEEP => ResetReason::DeepSleep,
            esp_reset_reason_t_ESP_RST_BROWNOUT => ResetReason::Brownout,
            esp_reset_reason_t_ESP_RST_SDIO => ResetReason::Sdio,
            _ => ResetReason::Unknown,
        }
    }
}

impl Drop for EspPlatform {
    fn drop(&mut self) {
        self.abort_image_write();
    }
}
