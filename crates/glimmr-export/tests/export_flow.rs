use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use glimmr_export::{
    Dataset, DatasetScope, ExportJobRunner, ExportProgress, ExportRequest, ExportRoute,
    ExportService, ExportSettings, ExportStatus, ExportWriter, Filters, Format,
    InMemoryProgressStore, LocalJobQueue, MemoryDatasetReader, ProgressStore, ProgressSweeper,
    Row, StreamingSerializer,
};
use serde_json::{Value, json};

struct Harness {
    service: Arc<ExportService>,
    store: Arc<InMemoryProgressStore>,
    queue: Arc<LocalJobQueue>,
    _dir: tempfile::TempDir,
}

fn rows(prefix: &str, n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| {
            json!({"id": format!("{prefix}-{i}"), "hospitalId": "h-1", "state": "CA"})
                .as_object()
                .cloned()
                .unwrap()
        })
        .collect()
}

fn harness(settings: ExportSettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let settings = Arc::new(ExportSettings {
        export_dir: dir.path().to_path_buf(),
        ..settings
    });
    let reader = Arc::new(
        MemoryDatasetReader::new()
            .with_rows(Dataset::Hospitals, rows("h", 120))
            .with_rows(Dataset::Prices, rows("p", 120))
            .with_rows(Dataset::Analytics, rows("a", 120)),
    );
    let runner = ExportJobRunner::new(
        StreamingSerializer::new(reader.clone(), settings.page_size),
        settings.export_dir.clone(),
        settings.public_base_path.clone(),
    );
    let queue = Arc::new(LocalJobQueue::start(runner, 1, 4));
    let store = Arc::new(InMemoryProgressStore::new());
    let service = Arc::new(ExportService::new(
        reader,
        store.clone(),
        queue.clone(),
        settings,
    ));
    Harness {
        service,
        store,
        queue,
        _dir: dir,
    }
}

fn request(format: Format, dataset: DatasetScope, limit: u64) -> ExportRequest {
    ExportRequest {
        format,
        dataset,
        limit,
        filters: Filters::new(),
    }
}

#[tokio::test]
async fn async_export_runs_to_completion() {
    let h = harness(ExportSettings {
        async_record_threshold: 50,
        page_size: 20,
        ..Default::default()
    });

    let ticket = h
        .service
        .request_export(request(Format::Json, DatasetScope::All, 300))
        .await
        .unwrap();
    assert_eq!(ticket.route(), ExportRoute::Asynchronous);
    // The estimate uses a third of the limit per dataset; the job writes up
    // to the full limit from each.
    assert_eq!(ticket.decision.estimate.estimated_records, 300);

    let mut observed = Vec::new();
    let final_progress = loop {
        let progress = h.service.status(&ticket.export_id).await.unwrap().unwrap();
        observed.push(progress.progress);
        if progress.status.is_terminal() {
            break progress;
        }
        assert!(observed.len() < 500, "export never finished");
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    assert_eq!(final_progress.status, ExportStatus::Completed);
    assert_eq!(final_progress.processed_records, Some(360));
    assert_eq!(
        final_progress.download_url,
        Some(format!("/analytics/export/{}/download", ticket.export_id))
    );
    assert!(observed.windows(2).all(|w| w[0] <= w[1]));

    let artifact = h
        .service
        .artifact(&ticket.export_id)
        .await
        .unwrap()
        .unwrap();
    let body = tokio::fs::read(&artifact.path).await.unwrap();
    let parsed: Vec<Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed.len(), 360);
    assert_eq!(parsed[0]["type"], "hospital");
    assert_eq!(parsed[120]["type"], "price");
    assert_eq!(parsed[359]["type"], "analytics");

    // Terminal records no longer change.
    let again = h.service.status(&ticket.export_id).await.unwrap().unwrap();
    assert_eq!(again, final_progress);

    h.queue.shutdown().await;
}

#[tokio::test]
async fn sync_download_streams_the_planned_rows() {
    let h = harness(ExportSettings::default());
    let req = request(Format::Csv, DatasetScope::Prices, 30);

    let sync = h.service.prepare_sync(&req).await.unwrap();
    assert_eq!(sync.estimate.records, 30);

    let mut writer = ExportWriter::for_format(req.format);
    let mut sink = Vec::new();
    let summary = h
        .service
        .write_sync(&sync.plan, &mut writer, &mut sink)
        .await
        .unwrap();
    assert_eq!(summary.records(), 30);

    let text = String::from_utf8(sink).unwrap();
    assert_eq!(text.lines().next(), Some("id,hospitalId,state"));
    assert_eq!(text.lines().count(), 31);

    h.queue.shutdown().await;
}

#[tokio::test]
async fn history_lists_newest_first() {
    let h = harness(ExportSettings::default());
    let first = h
        .service
        .request_export(request(Format::Json, DatasetScope::Hospitals, 5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = h
        .service
        .request_export(request(Format::Csv, DatasetScope::Prices, 5))
        .await
        .unwrap();

    let ids: Vec<String> = h
        .service
        .history()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.export_id)
        .collect();
    assert_eq!(ids, vec![second.export_id, first.export_id]);

    h.queue.shutdown().await;
}

#[tokio::test]
async fn sweeper_removes_expired_records_in_the_background() {
    let h = harness(ExportSettings::default());
    let now = Utc::now();
    h.store
        .create(ExportProgress::pending(
            "stale",
            1,
            now - chrono::Duration::hours(25),
        ))
        .await
        .unwrap();
    h.store
        .create(ExportProgress::pending(
            "fresh",
            1,
            now - chrono::Duration::hours(23),
        ))
        .await
        .unwrap();

    let sweeper = ProgressSweeper::start(h.service.clone(), Duration::from_millis(10));
    for _ in 0..100 {
        if h.store.get("stale").await.unwrap().is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sweeper.shutdown().await;

    assert!(h.store.get("stale").await.unwrap().is_none());
    assert!(h.store.get("fresh").await.unwrap().is_some());
    h.queue.shutdown().await;
}
