use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crep_adapters::Pacing;
use crep_core::{MonthKey, OutcomeStatus};
use crep_storage::{
    read_table, ApiRequest, ApiResponse, BackoffPolicy, BackoffRequester, NoJitter, Sleeper,
    SnapshotStore, Transport, TransportError,
};
use crep_sync::{ExecutionTracker, SyncConfig, SyncPipeline, TopicExtractor, WorkItem, MANIFEST_FILE};
use serde_json::json;
use tempfile::TempDir;

const TOPICS: &str = r#"
topics:
  - id: rankingDeCusto
    display_name: Ranking de custo
    url_env: CREP_TEST_URL_RANKING_UNSET
    payload:
      tipoRanking: CENTRO
    key_columns: [centroDeCustoDescr, competenciaDescr, unidade]
  - id: Consumo
    display_name: Consumo
    url_env: CREP_TEST_URL_CONSUMO_UNSET
    key_columns: [produto, competencia, unidade]
"#;

const SNAPSHOT_HEADER: &str = "unidade_id;nome;token;competencia;situacao";

type Responder = dyn Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync;

struct ScriptedTransport {
    requests: Mutex<Vec<ApiRequest>>,
    respond: Box<Responder>,
}

impl ScriptedTransport {
    fn new(
        respond: impl Fn(&ApiRequest) -> Result<ApiResponse, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.respond)(request)
    }
}

#[derive(Default)]
struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
    }
}

fn items(value: serde_json::Value) -> Result<ApiResponse, TransportError> {
    Ok(ApiResponse::new(200, json!({ "items": value }).to_string()))
}

struct Fixture {
    _dir: TempDir,
    workspace: PathBuf,
    data: PathBuf,
    month: MonthKey,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        let data = dir.path().join("data");
        fs::create_dir_all(&workspace).unwrap();
        fs::write(workspace.join("topics.yaml"), TOPICS).unwrap();
        Self {
            workspace,
            data,
            month: "03_2024".parse().unwrap(),
            _dir: dir,
        }
    }

    fn store(&self) -> SnapshotStore {
        SnapshotStore::new(&self.data)
    }

    fn write(&self, month: MonthKey, name: &str, lines: &[&str]) -> PathBuf {
        let dir = self.store().month_dir(month);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    fn snapshot(&self, month: MonthKey, rows: &[&str]) {
        let mut lines = vec![SNAPSHOT_HEADER];
        lines.extend_from_slice(rows);
        self.write(month, "competencias_todas_unidades.csv", &lines);
    }

    fn previous_datasets(&self) -> (PathBuf, PathBuf) {
        let prior = self.month.previous();
        let ranking = self.write(
            prior,
            "api_rankingdecusto_02_2024.csv",
            &[
                "centroDeCustoDescr;competenciaDescr;unidade;valor",
                "CC1;01/2024;Hospital A;10",
                "CC9;12/2023;Hospital A;5",
            ],
        );
        let consumo = self.write(
            prior,
            "api_consumo_02_2024.csv",
            &["produto;competencia;unidade;quantidade", "Luvas;01/2024;Hospital A;40"],
        );
        (ranking, consumo)
    }

    fn config(&self) -> SyncConfig {
        SyncConfig {
            data_root: self.data.clone(),
            roster_path: self.workspace.join("unidades_tokens.csv"),
            workspace_root: self.workspace.clone(),
            target_month: self.month,
            competency_url: None,
            http_timeout_secs: 5,
            user_agent: "crep-test".to_string(),
            pacing: Pacing {
                delay_between_calls: Duration::from_millis(300),
                delay_between_units: Duration::from_secs(3),
                group_by_unit: true,
                backoff: BackoffPolicy::default(),
            },
            closed_only: true,
            min_competency_year: 2023,
            drive_folder_id: None,
        }
    }

    fn pipeline(
        &self,
        transport: Arc<ScriptedTransport>,
        sleeper: Arc<RecordingSleeper>,
    ) -> SyncPipeline {
        let requester =
            BackoffRequester::new(transport.clone(), sleeper.clone()).with_jitter(Arc::new(NoJitter));
        SyncPipeline::with_transport(self.config(), transport, sleeper)
            .unwrap()
            .with_requester(requester)
            .with_base_url("rankingDeCusto", "http://api.test/ranking/")
    }

    /// Hospital A 12/2023 was already captured twice; Hospital A 01/2024 and
    /// UPA B 02/2024 are new closed work.
    fn process_month(&self) {
        self.snapshot(
            "01_2024".parse().unwrap(),
            &["1;Hospital A;tok-a;12/2023;FECHADA"],
        );
        self.snapshot(
            "02_2024".parse().unwrap(),
            &[
                "1;Hospital A;tok-a;12/2023;FECHADA",
                "1;Hospital A;tok-a;01/2024;FECHADA",
            ],
        );
        self.snapshot(
            self.month,
            &[
                "1;Hospital A;tok-a;12/2023;FECHADA",
                "1;Hospital A;tok-a;01/2024;FECHADA",
                "2;UPA B;tok-b;02/2024;FECHADA",
                "2;UPA B;tok-b;03/2024;ABERTA",
            ],
        );
    }
}

fn ranking_responder(request: &ApiRequest) -> Result<ApiResponse, TransportError> {
    match request.url.as_str() {
        "http://api.test/ranking/1" => items(json!([
            {"centroDeCustoDescr": "CC1", "competenciaDescr": "2024-01", "valor": 11}
        ])),
        "http://api.test/ranking/2" => items(json!([
            {"centroDeCustoDescr": "CC2", "competenciaDescr": "02/2024", "valor": 7}
        ])),
        other => panic!("unexpected request to {other}"),
    }
}

#[tokio::test]
async fn process_month_extracts_merges_and_reports() {
    let fixture = Fixture::new();
    fixture.process_month();
    fixture.previous_datasets();

    let transport = ScriptedTransport::new(ranking_responder);
    let sleeper = Arc::new(RecordingSleeper::default());
    let summary = fixture
        .pipeline(transport.clone(), sleeper.clone())
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.mode, "process");
    assert_eq!(summary.work_items, 2);
    assert_eq!(summary.outcomes.total, 2);
    assert_eq!(summary.outcomes.success, 2);
    assert_eq!(summary.outcomes.records, 2);

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].bearer_token, "tok-a");
    let body = requests[0].body.as_ref().unwrap();
    assert_eq!(body["competenciaInicial"], "01/2024");
    assert_eq!(body["competenciaFinal"], "01/2024");
    assert_eq!(body["tipoRanking"], "CENTRO");

    let month_dir = fixture.store().month_dir(fixture.month);
    let merged = read_table(&month_dir.join("api_rankingdecusto_03_2024.csv")).unwrap();
    assert_eq!(merged.len(), 3);
    assert_eq!(merged.cell(0, "valor"), Some("11"));
    assert_eq!(merged.cell(0, "competenciaDescr"), Some("01/2024"));
    assert_eq!(merged.cell(1, "unidade"), Some("UPA B"));
    assert_eq!(merged.cell(2, "centroDeCustoDescr"), Some("CC9"));

    // Consumo has no endpoint configured, so last month's file is carried over.
    assert!(month_dir.join("api_consumo_02_2024.csv").is_file());
    assert!(summary.files.contains(&"api_consumo_02_2024.csv".to_string()));

    let manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(month_dir.join(MANIFEST_FILE)).unwrap()).unwrap();
    assert_eq!(manifest["mode"], "process");
    assert_eq!(manifest["files"].as_array().unwrap().len(), 2);

    let reports: Vec<_> = fs::read_dir(&month_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("relatorio_execucao_"))
        .collect();
    assert_eq!(reports.len(), 2);
}

#[tokio::test]
async fn unit_change_adds_the_unit_pause() {
    let fixture = Fixture::new();
    fixture.process_month();

    let transport = ScriptedTransport::new(ranking_responder);
    let sleeper = Arc::new(RecordingSleeper::default());
    fixture
        .pipeline(transport, sleeper.clone())
        .run_once()
        .await
        .unwrap();

    assert_eq!(
        sleeper.waits(),
        vec![Duration::from_millis(300), Duration::from_secs(3)]
    );
}

#[tokio::test]
async fn copy_month_reproduces_previous_files_byte_for_byte() {
    let fixture = Fixture::new();
    let captured = "1;Hospital A;tok-a;12/2023;FECHADA";
    for month in ["01_2024", "02_2024"] {
        fixture.snapshot(month.parse().unwrap(), &[captured]);
    }
    fixture.snapshot(fixture.month, &[captured, "1;Hospital A;tok-a;02/2024;ABERTA"]);
    let (ranking, consumo) = fixture.previous_datasets();

    let transport = ScriptedTransport::new(|request| panic!("no request expected: {}", request.url));
    let sleeper = Arc::new(RecordingSleeper::default());
    let summary = fixture
        .pipeline(transport.clone(), sleeper)
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.mode, "copy");
    assert!(transport.requests().is_empty());
    let month_dir = fixture.store().month_dir(fixture.month);
    for original in [ranking, consumo] {
        let copied = month_dir.join(original.file_name().unwrap());
        assert_eq!(fs::read(&copied).unwrap(), fs::read(&original).unwrap());
    }
    assert!(!fixture.store().work_list_path(fixture.month).exists());
}

#[tokio::test]
async fn missing_current_snapshot_falls_back_to_copy() {
    let fixture = Fixture::new();
    fixture.previous_datasets();

    let transport = ScriptedTransport::new(|request| panic!("no request expected: {}", request.url));
    let summary = fixture
        .pipeline(transport, Arc::new(RecordingSleeper::default()))
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.mode, "copy");
    assert_eq!(summary.files.len(), 2);
}

#[tokio::test]
async fn persistent_rejection_is_recorded_and_the_run_moves_on() {
    let fixture = Fixture::new();
    let topic = crep_adapters::TopicCatalog::from_yaml_str(TOPICS)
        .unwrap()
        .topics
        .remove(0);
    let transport = ScriptedTransport::new(|request| match request.url.as_str() {
        "http://api.test/ranking/1" => Ok(ApiResponse::new(403, "forbidden")),
        _ => items(json!([{"centroDeCustoDescr": "CC2", "competenciaDescr": "02/2024"}])),
    });
    let sleeper = Arc::new(RecordingSleeper::default());
    let requester =
        BackoffRequester::new(transport.clone(), sleeper.clone()).with_jitter(Arc::new(NoJitter));
    let extractor = TopicExtractor::new(
        requester,
        fixture.store(),
        fixture.month,
        fixture.config().pacing,
    );

    let unit = |id: &str, name: &str| crep_core::Unit {
        id: id.to_string(),
        name: name.to_string(),
        token: format!("tok-{id}"),
    };
    let work = vec![
        WorkItem {
            unit: unit("1", "Hospital A"),
            period: Some("01/2024".to_string()),
        },
        WorkItem {
            unit: unit("2", "UPA B"),
            period: Some("02/2024".to_string()),
        },
    ];
    let mut tracker = ExecutionTracker::new();
    let path = extractor
        .extract_items(work, &topic, "http://api.test/ranking/", &mut tracker)
        .await
        .unwrap();

    assert_eq!(transport.requests().len(), 5);
    assert_eq!(
        sleeper.waits(),
        vec![
            Duration::from_secs(3),
            Duration::from_secs(6),
            Duration::from_secs(12),
            Duration::from_millis(300),
            Duration::from_secs(3),
        ]
    );
    let outcomes = tracker.outcomes();
    assert_eq!(outcomes[0].status, OutcomeStatus::Error);
    assert!(outcomes[0].error.as_deref().unwrap().contains("403"));
    assert_eq!(outcomes[1].status, OutcomeStatus::Success);
    assert_eq!(read_table(&path).unwrap().len(), 1);
}

#[tokio::test]
async fn competency_refresh_builds_the_snapshot_from_the_roster() {
    let fixture = Fixture::new();
    fs::write(
        fixture.workspace.join("unidades_tokens.csv"),
        "id;nome;token\n1;Hospital A;tok-a\n2;UPA B;tok-b\n",
    )
    .unwrap();
    let transport = ScriptedTransport::new(|request| match request.url.as_str() {
        "http://api.test/competencias/1" => items(json!([
            {"mes": 1, "ano": 2024, "situacao": "FECHADA"},
            {"mes": 2, "ano": 2022, "situacao": "FECHADA"}
        ])),
        _ => Ok(ApiResponse::new(500, "")),
    });
    let sleeper = Arc::new(RecordingSleeper::default());
    let mut config = fixture.config();
    config.competency_url = Some("http://api.test/competencias/".to_string());
    let pipeline = SyncPipeline::with_transport(config, transport.clone(), sleeper.clone()).unwrap();

    let path = pipeline.fetch_competencies().await.unwrap().unwrap();
    let snapshot = fixture.store().load_competencies(fixture.month).unwrap();
    assert_eq!(path, snapshot.path);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.entries[0].key(), "Hospital A_01/2024");
    assert_eq!(transport.requests().len(), 2);
    // Roster units are paced by the per-call delay, not the unit-change pause.
    assert_eq!(sleeper.waits(), vec![Duration::from_millis(300)]);
}

#[tokio::test]
async fn unusable_work_list_makes_no_requests_and_writes_no_dataset() {
    let fixture = Fixture::new();
    let topic = crep_adapters::TopicCatalog::from_yaml_str(TOPICS)
        .unwrap()
        .topics
        .remove(0);
    let work_list = fixture.write(
        fixture.month,
        "work.csv",
        &["unidade_id;nome;situacao", "1;Hospital A;FECHADA"],
    );
    let transport = ScriptedTransport::new(|request| panic!("no request expected: {}", request.url));
    let sleeper = Arc::new(RecordingSleeper::default());
    let requester =
        BackoffRequester::new(transport.clone(), sleeper.clone()).with_jitter(Arc::new(NoJitter));
    let extractor = TopicExtractor::new(
        requester,
        fixture.store(),
        fixture.month,
        fixture.config().pacing,
    );

    let mut tracker = ExecutionTracker::new();
    let extracted = extractor
        .extract(&work_list, &topic, "http://api.test/ranking/", &mut tracker)
        .await;

    assert!(extracted.is_none());
    assert!(transport.requests().is_empty());
    assert!(tracker.outcomes().is_empty());
    let month_dir = fixture.store().month_dir(fixture.month);
    let datasets: Vec<_> = fs::read_dir(&month_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("api_"))
        .collect();
    assert!(datasets.is_empty());
}

#[tokio::test]
async fn work_list_write_failure_falls_back_to_copy() {
    let fixture = Fixture::new();
    fixture.process_month();
    fixture.previous_datasets();
    let blocked = fixture.store().work_list_path(fixture.month);
    fs::create_dir_all(&blocked).unwrap();
    fs::write(blocked.join("keep"), "x").unwrap();

    let transport = ScriptedTransport::new(|request| panic!("no request expected: {}", request.url));
    let summary = fixture
        .pipeline(transport, Arc::new(RecordingSleeper::default()))
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.mode, "copy");
    assert_eq!(summary.files.len(), 2);
    assert!(summary.manifest.is_some());
}

#[tokio::test]
async fn unwritable_month_directory_still_finishes_the_run() {
    let fixture = Fixture::new();
    fixture.previous_datasets();
    let month_dir = fixture.store().month_dir(fixture.month);
    fs::create_dir_all(month_dir.parent().unwrap()).unwrap();
    fs::write(&month_dir, "not a directory").unwrap();

    let transport = ScriptedTransport::new(|request| panic!("no request expected: {}", request.url));
    let summary = fixture
        .pipeline(transport, Arc::new(RecordingSleeper::default()))
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.mode, "copy");
    assert!(summary.files.is_empty());
    assert!(summary.manifest.is_none());
}
