//! Response bodies fed by a background export task.
//!
//! The serializer writes into one end of an in-memory duplex pipe while the
//! other end is streamed to the client. A full pipe blocks the writer, and a
//! dropped response body turns the next write into a broken pipe, which ends
//! the task before it fetches another page.

use std::io;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use futures_util::{StreamExt, stream};
use glimmr_export::{ExportPlan, ExportService, ExportWriter};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Bytes buffered between the export task and the HTTP body.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Stream a synchronous export as it is produced.
///
/// Headers are already on the wire by the time rows are read, so a failure
/// can only be signalled by ending the body with an error; hyper then aborts
/// the connection instead of finishing the chunked response cleanly.
pub fn export_body(
    service: Arc<ExportService>,
    plan: ExportPlan,
    mut writer: ExportWriter,
) -> Body {
    let (mut sink, source) = tokio::io::duplex(PIPE_CAPACITY);

    let task = tokio::spawn(async move {
        service.write_sync(&plan, &mut writer, &mut sink).await?;
        sink.shutdown().await?;
        Ok::<_, glimmr_export::ExportError>(())
    });

    let tail = stream::once(async move {
        match task.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) if e.is_disconnect() => None,
            Ok(Err(e)) => Some(Err(io::Error::other(e.to_string()))),
            Err(e) => Some(Err(io::Error::other(format!("export task failed: {e}")))),
        }
    })
    .filter_map(|item| async move { item });

    Body::from_stream(ReaderStream::new(source).chain(tail))
}

/// Stream a finished export file from disk.
pub async fn file_body(path: &Path) -> io::Result<Body> {
    let file = tokio::fs::File::open(path).await?;
    Ok(Body::from_stream(ReaderStream::new(file)))
}
