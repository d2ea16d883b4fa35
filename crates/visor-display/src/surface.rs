use async_trait::async_trait;

use visor_core::errors::BridgeError;

/// The rendering collaborator: whatever can draw on the device. The
/// arbiter is the only caller; everything above it goes through the
/// arbiter's typed operations.
#[async_trait]
pub trait DisplaySurface: Send + Sync {
    async fn show_text(&self, body: &str) -> Result<(), BridgeError>;

    async fn show_card(&self, title: &str, body: &str) -> Result<(), BridgeError>;

    /// Renders a base64-encoded 1-bit BMP.
    async fn show_bitmap(&self, base64_bmp: &str) -> Result<(), BridgeError>;

    async fn clear(&self) -> Result<(), BridgeError>;

    /// Writes the persistent dashboard line. Cosmetic: callers swallow
    /// failures.
    async fn write_dashboard(&self, line: &str) -> Result<(), BridgeError>;
}
