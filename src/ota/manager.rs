// OTA Manager - flash-write sessions over the ESP-IDF OTA API

use core::ffi::c_void;
use esp_idf_sys::{
    esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_t,
    ESP_ERR_NO_MEM, ESP_OK, OTA_SIZE_UNKNOWN,
};

use clock_core::update::{FlashTarget, UpdateFailure, UpdateFailureCode};

/// One write session against the next update partition. Both update paths
/// drive it through the `FlashTarget` boundary; every driver error keeps its
/// raw code next to the classified one.
pub struct OtaManager {
    update_partition: *const esp_partition_t,
    ota_handle: Option<esp_ota_handle_t>,
}

impl OtaManager {
    pub fn new() -> Self {
        Self {
            update_partition: core::ptr::null(),
            ota_handle: None,
        }
    }
}

impl FlashTarget for OtaManager {
    fn begin(&mut self, size: Option<usize>) -> Result<(), UpdateFailure> {
        let update_partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if update_partition.is_null() {
            log::error!("no update partition available");
            return Err(UpdateFailure::new(UpdateFailureCode::MissingPartition, 0));
        }
        unsafe {
            log::info!(
                "writing to partition subtype {} at offset 0x{:x}",
                (*update_partition).subtype,
                (*update_partition).address
            );
        }

        // Takes on the order of a second: the partition is erased here.
        let image_size = size.unwrap_or(OTA_SIZE_UNKNOWN as usize);
        let mut handle: esp_ota_handle_t = Default::default();
        let err = unsafe { esp_ota_begin(update_partition, image_size as _, &mut handle) };
        if err != ESP_OK {
            log::error!("esp_ota_begin failed (0x{err:04x})");
            let code = if err == ESP_ERR_NO_MEM as i32 {
                UpdateFailureCode::OutOfMemory
            } else {
                UpdateFailureCode::SessionBegin
            };
            return Err(UpdateFailure::new(code, err));
        }

        self.update_partition = update_partition;
        self.ota_handle = Some(handle);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), UpdateFailure> {
        let Some(handle) = self.ota_handle else {
            return Err(UpdateFailure::new(UpdateFailureCode::FlashWrite, 0));
        };
        let err = unsafe { esp_ota_write(handle, chunk.as_ptr() as *const c_void, chunk.len() as _) };
        if err != ESP_OK {
            log::error!("esp_ota_write failed (0x{err:04x})");
            let code = if err == ESP_ERR_NO_MEM as i32 {
                UpdateFailureCode::OutOfMemory
            } else {
                UpdateFailureCode::FlashWrite
            };
            return Err(UpdateFailure::new(code, err));
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), UpdateFailure> {
        let Some(handle) = self.ota_handle.take() else {
            return Err(UpdateFailure::new(UpdateFailureCode::ImageValidation, 0));
        };
        let err = unsafe { esp_ota_end(handle) };
        if err != ESP_OK {
            // Invalid image
            log::warn!("invalid OTA image (0x{err:x})");
            return Err(UpdateFailure::new(UpdateFailureCode::ImageValidation, err));
        }
        Ok(())
    }

    fn set_boot(&mut self) -> Result<(), UpdateFailure> {
        if self.update_partition.is_null() {
            return Err(UpdateFailure::new(UpdateFailureCode::BootPartition, 0));
        }
        let err = unsafe { esp_ota_set_boot_partition(self.update_partition) };
        if err != ESP_OK {
            log::error!("esp_ota_set_boot_partition failed (0x{err:04x})");
            return Err(UpdateFailure::new(UpdateFailureCode::BootPartition, err));
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.ota_handle.take() {
            unsafe {
                esp_ota_abort(handle);
            }
        }
    }
}

impl Drop for OtaManager {
    fn drop(&mut self) {
        // Clean up any session that never reached finalize
        FlashTarget::abort(self);
    }
}
