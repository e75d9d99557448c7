//! A paginated import survives two process restarts on durable stores.
//!
//! Each process lifetime gets its own runtime; shutting it down drops the
//! worker mid-fetch the way a crash would.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::runtime::Runtime;

use ordersync_api::app::{self, AppServices, services::Stores};
use ordersync_core::JobId;
use ordersync_infra::config::{ImportConfig, StorageConfig};
use ordersync_infra::retry::RetryPolicy;
use ordersync_infra::upstream::PageRequest;
use ordersync_infra::upstream::fake::{ScriptedOrderSource, sample_orders};

const ORDERS: u64 = 1000;

struct Process {
    services: Arc<AppServices>,
    base_url: String,
    client: reqwest::Client,
}

impl Process {
    async fn boot(state_dir: &Path, source: Arc<ScriptedOrderSource>) -> Self {
        let storage = StorageConfig {
            state_dir: Some(state_dir.to_path_buf()),
            database_url: None,
        };
        let config = ImportConfig {
            page_size: 100,
            inter_page_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(10),
            retry: RetryPolicy::exponential(2, Duration::from_millis(5), Duration::from_millis(20)),
            count_total: false,
            ..ImportConfig::default()
        };
        let stores = Stores::open(&storage).await.unwrap();
        let services = Arc::new(AppServices::new(source, stores, config));

        let app = app::build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            services,
            base_url,
            client: reqwest::Client::new(),
        }
    }

    async fn get_json(&self, path: &str) -> Value {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }
}

fn shut_down(rt: Runtime) {
    rt.shutdown_timeout(Duration::from_secs(5));
}

#[test]
fn import_resumes_across_two_restarts_without_duplicates() {
    let state = tempfile::tempdir().unwrap();

    // First process: start the import, die while fetching the fourth page.
    let rt = Runtime::new().unwrap();
    let job_id = rt.block_on(async {
        let source = Arc::new(ScriptedOrderSource::new(sample_orders(ORDERS)));
        let stalled = source.stall_fetch_at(300);
        let process = Process::boot(state.path(), source).await;

        let started: Value = process
            .client
            .post(format!("{}/import", process.base_url))
            .json(&json!({ "mode": "paginated", "dateFrom": "2024-05-01", "dateTo": "2024-05-31" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        stalled.notified().await;
        started["jobId"].as_str().unwrap().parse::<JobId>().unwrap()
    });
    shut_down(rt);

    // Second process: the job is still running on disk; recovery picks it up.
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let source = Arc::new(ScriptedOrderSource::new(sample_orders(ORDERS)));
        let stalled = source.stall_fetch_at(700);
        let process = Process::boot(state.path(), source.clone()).await;

        let before = process.get_json(&format!("/import?jobId={job_id}")).await;
        assert_eq!(before["job"]["status"], "running");
        assert_eq!(before["job"]["results"]["imported"], 300);

        assert_eq!(process.services.orchestrator.recover(), vec![job_id]);
        stalled.notified().await;

        let requests = source.page_requests();
        assert!(matches!(&requests[0], PageRequest::Next { cursor, .. } if cursor == "cursor-300"));
    });
    shut_down(rt);

    // Third process: recovery runs the job to completion.
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let source = Arc::new(ScriptedOrderSource::new(sample_orders(ORDERS)));
        let process = Process::boot(state.path(), source).await;
        assert_eq!(process.services.orchestrator.recover(), vec![job_id]);

        let mut detail = Value::Null;
        for _ in 0..500 {
            detail = process.get_json(&format!("/import/{job_id}")).await;
            if detail["job"]["status"] == "completed" && detail["checkpoint"].is_null() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(detail["job"]["id"], job_id.to_string());
        assert_eq!(detail["job"]["status"], "completed");
        assert_eq!(detail["job"]["results"]["imported"], ORDERS);
        assert_eq!(detail["job"]["results"]["duplicates"], 0);
        assert_eq!(detail["job"]["results"]["failed"], 0);
        assert!(detail["checkpoint"].is_null());
        assert_eq!(process.services.invoices.count(), ORDERS as usize);

        let listed = process.get_json("/import").await;
        assert_eq!(listed["jobs"].as_array().unwrap().len(), 1);
    });
    shut_down(rt);

    // The invoices outlive the processes that created them.
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let process = Process::boot(state.path(), Arc::new(ScriptedOrderSource::new(Vec::new()))).await;
        assert_eq!(process.services.invoices.count(), ORDERS as usize);
        assert!(process.services.orchestrator.recover().is_empty());
    });
    shut_down(rt);
}
