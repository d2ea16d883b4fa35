//! Bitmap helpers. The display SDK takes base64-encoded 1-bit BMPs at
//! the panel's padded frame size.

use base64::Engine;

/// Padded frame dimensions the device SDK expects.
const FRAME_WIDTH: u32 = 576;
const FRAME_HEIGHT: u32 = 136;

/// A solid black full-frame BMP, base64 encoded. Rendered briefly before
/// clearing a bitmap so no ghost of the image stays lit on the panel.
pub fn solid_black_frame() -> String {
    base64::engine::general_purpose::STANDARD.encode(black_bmp(FRAME_WIDTH, FRAME_HEIGHT))
}

/// Build a 1-bpp BMP filled with palette entry 0 (black).
fn black_bmp(width: u32, height: u32) -> Vec<u8> {
    let row_bytes = ((width + 31) / 32) * 4; // rows pad to 4 bytes
    let data_size = row_bytes * height;
    let data_offset: u32 = 14 + 40 + 8; // file header + info header + 2-color palette
    let file_size = data_offset + data_size;

    let mut bmp = Vec::with_capacity(file_size as usize);
    // BITMAPFILEHEADER
    bmp.extend_from_slice(b"BM");
    bmp.extend_from_slice(&file_size.to_le_bytes());
    bmp.extend_from_slice(&0u32.to_le_bytes());
    bmp.extend_from_slice(&data_offset.to_le_bytes());
    // BITMAPINFOHEADER
    bmp.extend_from_slice(&40u32.to_le_bytes());
    bmp.extend_from_slice(&(width as i32).to_le_bytes());
    bmp.extend_from_slice(&(height as i32).to_le_bytes());
    bmp.extend_from_slice(&1u16.to_le_bytes()); // planes
    bmp.extend_from_slice(&1u16.to_le_bytes()); // bits per pixel
    bmp.extend_from_slice(&0u32.to_le_bytes()); // no compression
    bmp.extend_from_slice(&data_size.to_le_bytes());
    bmp.extend_from_slice(&2835i32.to_le_bytes()); // 72 dpi
    bmp.extend_from_slice(&2835i32.to_le_bytes());
    bmp.extend_from_slice(&2u32.to_le_bytes()); // palette size
    bmp.extend_from_slice(&2u32.to_le_bytes());
    // Palette: black, white (BGRA)
    bmp.extend_from_slice(&[0, 0, 0, 0]);
    bmp.extend_from_slice(&[255, 255, 255, 0]);
    // Pixel data: every bit 0 -> black
    bmp.resize((file_size) as usize, 0);
    bmp
}
