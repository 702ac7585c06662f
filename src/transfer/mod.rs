pub mod background;
pub mod downloader;

pub use background::{
    BackgroundUpload, BackgroundUploadCoordinator, BackgroundUploadKind, TaskId, UploadError,
    UploadRequest, UploadTransport,
};
pub use downloader::{
    AttachmentDownloader, Download, DownloadError, Update, UpdateKind, MAX_CONCURRENT_DOWNLOADS,
};

use std::io::Read;
use std::path::Path;

/// MD5 digest of a file's content, hex-encoded. The transfer subsystem uses
/// it as the attachment content identity.
pub fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}
