//! Config reconciliation tests

use rollctl::config::env_file::EnvironmentConfig;
use rollctl::config::overrides::{allowed_hosts, computed_overrides, required_defaults};
use rollctl::config::reconciler::{ConfigReconciler, KeyValues};
use rollctl::filesys::file::File;
use rollctl::manifest::model::{ManifestTemplate, TopologyKind};

fn overrides(topology: TopologyKind) -> KeyValues {
    let hosts = allowed_hosts(Some("web-1"), Some("203.0.113.7"), &[]);
    computed_overrides(topology, &ManifestTemplate::default(), &hosts)
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".env");
    let reconciler = ConfigReconciler::new(File::new(&path), None);

    let first = reconciler
        .reconcile(&required_defaults(), &overrides(TopologyKind::Bind))
        .await
        .unwrap();
    assert!(first.created);
    assert!(first.changed);
    let after_first = std::fs::read(&path).unwrap();

    // A fresh secret is offered again but must not replace the stored one
    let second = reconciler
        .reconcile(&required_defaults(), &overrides(TopologyKind::Bind))
        .await
        .unwrap();
    assert!(!second.created);
    assert!(!second.changed);
    assert_eq!(std::fs::read(&path).unwrap(), after_first);

    let config = EnvironmentConfig::parse(&String::from_utf8(after_first).unwrap());
    let mut keys = config.keys();
    let total = keys.len();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), total, "no duplicate keys");
    assert_eq!(config.get("SECRET_KEY").unwrap().len(), 64);
}

#[tokio::test]
async fn test_reconcile_preserves_order_and_comments() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".env");
    std::fs::write(
        &path,
        "# app settings\nDEBUG=False\nALLOWED_HOSTS=old.example.com\n\nEMAIL_HOST=smtp.example.com\nSECRET_KEY=keep-me\n",
    )
    .unwrap();
    let reconciler = ConfigReconciler::new(File::new(&path), None);

    let result = reconciler
        .reconcile(&required_defaults(), &overrides(TopologyKind::Bind))
        .await
        .unwrap();
    assert!(result.changed);
    assert!(result.warnings.is_empty());

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "# app settings\n\
         DEBUG=False\n\
         ALLOWED_HOSTS=localhost,127.0.0.1,web-1,203.0.113.7\n\
         \n\
         EMAIL_HOST=smtp.example.com\n\
         SECRET_KEY=keep-me\n\
         DATABASE_URL=sqlite:////app/data/db.sqlite3\n"
    );
}

#[tokio::test]
async fn test_duplicate_enforced_key_collapses_to_first() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".env");
    std::fs::write(
        &path,
        "DATABASE_URL=a\nSECRET_KEY=s\nDATABASE_URL=b\n",
    )
    .unwrap();
    let reconciler = ConfigReconciler::new(File::new(&path), None);

    reconciler
        .reconcile(&required_defaults(), &overrides(TopologyKind::Relational))
        .await
        .unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.matches("DATABASE_URL=").count(), 1);
    assert!(text.starts_with("DATABASE_URL=postgres://app@db:5432/app\n"));
    assert!(text.contains("REDIS_URL=redis://cache:6379/0\n"));
}

#[tokio::test]
async fn test_template_is_used_for_new_file() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join(".env.example");
    std::fs::write(&template, "# from template\nSECRET_KEY=your-secret-key\nTIME_ZONE=UTC\n").unwrap();
    let reconciler = ConfigReconciler::new(File::new(dir.path().join(".env")), Some(File::new(&template)));

    let result = reconciler
        .reconcile(&required_defaults(), &overrides(TopologyKind::Volume))
        .await
        .unwrap();

    assert!(result.created);
    // The generated secret replaces the template placeholder on creation
    assert!(result.warnings.is_empty());
    let text = std::fs::read_to_string(dir.path().join(".env")).unwrap();
    assert!(text.starts_with("# from template\nSECRET_KEY="));
    assert!(!text.contains("your-secret-key"));
    assert!(text.contains("TIME_ZONE=UTC\n"));
}

#[tokio::test]
async fn test_prepare_does_not_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".env");
    let reconciler = ConfigReconciler::new(File::new(&path), None);

    let plan = reconciler
        .prepare(&required_defaults(), &overrides(TopologyKind::Bind))
        .await
        .unwrap();
    assert!(plan.changed);
    assert!(!path.exists());

    assert!(reconciler.commit(&plan).await.unwrap());
    assert!(path.exists());
}
