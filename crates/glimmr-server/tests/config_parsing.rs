use std::io::Write;

use glimmr_server::config::loader::load_config;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn file_values_override_defaults() {
    let file = write_config(
        r#"
[server]
host = "127.0.0.1"
body_limit_bytes = 2048

[storage.postgres]
host = "db.internal"
database = "prices"
pool_size = 4

[redis]
enabled = true
url = "redis://cache:6379"
key_prefix = "tenant-a"

[export]
max_records = 50000
buffered_max_records = 20000
async_record_threshold = 5000
worker_count = 4
export_dir = "/var/lib/glimmr/exports"

[export.format_multipliers]
csv = 0.5

[logging]
level = "debug"
"#,
    );

    let cfg = load_config(file.path().to_str()).unwrap();
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert_eq!(cfg.server.body_limit_bytes, 2048);

    let pg = cfg.storage.postgres.as_ref().unwrap();
    assert_eq!(pg.connection_url(), "postgres://postgres@db.internal:5432/prices");
    assert_eq!(pg.pool_size, 4);

    assert!(cfg.redis.enabled);
    assert_eq!(cfg.redis.key_prefix, "tenant-a");

    assert_eq!(cfg.export.max_records, 50_000);
    assert_eq!(cfg.export.buffered_max_records, 20_000);
    assert_eq!(cfg.export.async_record_threshold, 5_000);
    assert_eq!(cfg.export.worker_count, 4);
    assert_eq!(
        cfg.export.export_dir.to_str(),
        Some("/var/lib/glimmr/exports")
    );
    assert_eq!(cfg.export.format_multipliers.csv, 0.5);
    // Untouched keys keep their defaults.
    assert_eq!(cfg.export.retention_hours, 24);
    assert_eq!(cfg.export.public_base_path, "/analytics/export");

    assert_eq!(cfg.logging.level, "debug");
}

#[test]
fn invalid_values_are_rejected_with_the_key_name() {
    let file = write_config(
        r#"
[export]
buffered_max_records = 200000
max_records = 1000
"#,
    );
    let err = load_config(file.path().to_str()).unwrap_err();
    assert!(err.contains("export.buffered_max_records"), "{err}");

    let file = write_config(
        r#"
[logging]
level = "chatty"
"#,
    );
    let err = load_config(file.path().to_str()).unwrap_err();
    assert!(err.contains("logging.level"), "{err}");
}

#[test]
fn environment_overrides_apply_without_a_file() {
    // SAFETY: the other tests here never assert on these two keys.
    unsafe {
        std::env::set_var("GLIMMR__SERVER__PORT", "7070");
        std::env::set_var("GLIMMR__EXPORT__PAGE_SIZE", "250");
    }

    let result = load_config(Some("/nonexistent/glimmr.toml"));

    unsafe {
        std::env::remove_var("GLIMMR__SERVER__PORT");
        std::env::remove_var("GLIMMR__EXPORT__PAGE_SIZE");
    }

    let cfg = result.unwrap();
    assert_eq!(cfg.server.port, 7070);
    assert_eq!(cfg.export.page_size, 250);
    assert_eq!(cfg.export.max_records, 100_000);
}
