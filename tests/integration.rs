//! Integration tests for backline

use backline::transport::MemoryCluster;
use backline::{
    FailureDetector, ReplicaManager, ServerConfig, ServerDetails, ServerId, ServerList, ServiceType,
};
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
coordinator_locator = "mock:host=coordinator"
local_locator = "mock:host=m1"
services = ["master", "ping", "membership"]

[master]
num_replicas = 2
segment_size = 65536
max_write_rpcs_in_flight = 2

[backup]
mock_speed_mbps = 100

[failure_detector]
probe_interval_ms = 20
ping_timeout_ms = 10
stale_server_list_ms = 100
"#;

fn write_config() -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    file
}

#[tokio::test(start_paused = true)]
async fn test_server_from_config_file() {
    let file = write_config();
    let config = ServerConfig::load(file.path()).unwrap();
    assert_eq!(config.master.num_replicas, 2);
    assert!(!config.services.has(ServiceType::Backup));

    let cluster = MemoryCluster::new();
    let list = Arc::new(ServerList::new());
    let me = ServerId::new(1, 0);
    list.add(ServerDetails::new(me, config.local_locator.clone(), &[ServiceType::Master]));
    for index in 2..5 {
        let locator = format!("mock:host=b{}", index);
        cluster.add_server(&locator);
        list.add(
            ServerDetails::new(ServerId::new(index, 0), locator, &[ServiceType::Backup, ServiceType::Ping])
                .with_read_speed(config.backup.advertised_read_bytes_per_sec()),
        );
    }

    let replicas = ReplicaManager::new(&list, me, &config.master, Arc::new(cluster.clone()));
    assert_eq!(replicas.num_replicas, 2);
    let handles: Vec<_> = (0..6).map(|id| replicas.open_segment(id, b"segment")).collect();
    replicas.proceed();
    assert!(replicas.write_rpcs_in_flight() <= 2);
    replicas.sync().await;
    assert!(handles.iter().all(|h| h.is_synced()));
    for id in 0..6 {
        assert_eq!(cluster.replica_count(me, id), 2);
    }

    let mut detector = FailureDetector::new(
        me,
        list.clone(),
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
        &config.failure_detector,
    );
    detector.start().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    detector.halt().await;

    let pings: u64 = (2..5).map(|i| cluster.ping_count(&format!("mock:host=b{}", i))).sum();
    assert!(pings >= 5, "only {} pings", pings);
    assert!(cluster.hints().is_empty());
}

#[test]
fn test_invalid_config_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[failure_detector]\nping_timeout_ms = 0").unwrap();
    let err = ServerConfig::load(file.path()).unwrap_err();
    assert!(matches!(err, backline::Error::InvalidConfig(_)));
}

#[test]
fn test_version() {
    assert!(!backline::VERSION.is_empty());
    assert!(backline::BUILD_INFO.contains("backline"));
}
