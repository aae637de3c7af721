use crate::controller::{PublishController, PublishStatus};
use std::sync::RwLock;
use tauri::command;

lazy_static::lazy_static! {
    static ref CONTROLLER: RwLock<Option<PublishController>> = RwLock::new(None);
}

/// Make `controller` the one the commands drive.
pub fn install_controller(controller: PublishController) {
    let mut slot = CONTROLLER.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(controller);
}

fn controller() -> Result<PublishController, String> {
    let slot = CONTROLLER.read().map_err(|e| e.to_string())?;
    slot.clone()
        .ok_or_else(|| "Publisher not initialized".to_string())
}

/// Start publishing for the current navigation path
#[command]
pub async fn start_publishing(path: String) -> Result<String, String> {
    log::info!("Starting publish for {}", path);
    controller()?.start(&path).await.map_err(|e| e.to_string())
}

/// Stop publishing and release every device
#[command]
pub async fn stop_publishing() -> Result<PublishStatus, String> {
    let controller = controller()?;
    controller.stop().await;
    Ok(controller.status())
}

/// Switch between camera and screen capture, returns the new mode
#[command]
pub async fn toggle_capture_mode() -> Result<bool, String> {
    controller()?
        .toggle_capture_mode()
        .await
        .map_err(|e| e.to_string())
}

/// Follow a navigation change, restarting only when the path differs
#[command]
pub async fn navigate(path: String) -> Result<Option<String>, String> {
    controller()?.navigate(&path).await.map_err(|e| e.to_string())
}

#[command]
pub async fn get_publish_status() -> Result<PublishStatus, String> {
    Ok(controller()?.status())
}
