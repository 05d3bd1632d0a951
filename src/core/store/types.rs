use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROMPT_ID_PREFIX: &str = "ps_";
pub const RUN_ID_PREFIX: &str = "rs_";
pub const LEGACY_RUN_ID_PREFIX: &str = "run_";

/// Key under which a completed run records its result file.
pub const OUTPUT_PATH_KEY: &str = "output_path";
pub const ERROR_KEY: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Transfer,
    Enhancement,
    Reason,
    Predict,
}

impl ModelType {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::Transfer => "transfer",
            ModelType::Enhancement => "enhancement",
            ModelType::Reason => "reason",
            ModelType::Predict => "predict",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "transfer" => Some(ModelType::Transfer),
            "enhancement" => Some(ModelType::Enhancement),
            "reason" => Some(ModelType::Reason),
            "predict" => Some(ModelType::Predict),
            _ => None,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Pending and running runs still hold (or are about to hold) GPU work.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_prompt_id(id: &str) -> bool {
    id.len() > PROMPT_ID_PREFIX.len() && id.starts_with(PROMPT_ID_PREFIX)
}

/// Both `rs_` and the older `run_` prefix identify a run.
pub fn is_run_id(id: &str) -> bool {
    [RUN_ID_PREFIX, LEGACY_RUN_ID_PREFIX]
        .iter()
        .any(|prefix| id.len() > prefix.len() && id.starts_with(prefix))
}

pub fn new_prompt_id() -> String {
    format!("{}{}", PROMPT_ID_PREFIX, short_uuid())
}

pub fn new_run_id() -> String {
    format!("{}{}", RUN_ID_PREFIX, short_uuid())
}

fn short_uuid() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Name of the directory a run's outputs live in, relative to the outputs root.
pub fn run_dir_name(run_id: &str) -> String {
    format!("run_{}", run_id)
}

/// Inverse of [`run_dir_name`]. Returns `None` for directories that do not follow the layout.
pub fn run_id_from_dir_name(name: &str) -> Option<&str> {
    name.strip_prefix("run_").filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: String,
    pub prompt_text: String,
    pub negative_prompt: Option<String>,
    pub model_type: ModelType,
    pub inputs: BTreeMap<String, String>,
    pub parameters: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl PromptRecord {
    pub fn parent_prompt_id(&self) -> Option<&str> {
        self.parameters
            .get("parent_prompt_id")
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct NewPrompt {
    pub prompt_text: String,
    pub negative_prompt: Option<String>,
    pub model_type: ModelType,
    pub inputs: BTreeMap<String, String>,
    pub parameters: Map<String, Value>,
}

impl NewPrompt {
    pub fn validate(&self) -> Result<(), String> {
        if self.prompt_text.trim().is_empty() {
            return Err("prompt text must not be empty".to_string());
        }
        match self.inputs.get("video") {
            Some(path) if !path.trim().is_empty() => Ok(()),
            _ => Err("prompt requires a 'video' input".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlWeights {
    pub vis: f64,
    pub edge: f64,
    pub depth: f64,
    pub seg: f64,
}

impl Default for ControlWeights {
    fn default() -> Self {
        Self {
            vis: 0.25,
            edge: 0.25,
            depth: 0.25,
            seg: 0.25,
        }
    }
}

impl ControlWeights {
    pub fn parse_list(raw: &str) -> Result<Self, String> {
        let values: Vec<f64> = raw
            .split(',')
            .map(str::trim)
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|_| format!("invalid control weight '{}'", v))
            })
            .collect::<Result<_, _>>()?;
        match values.as_slice() {
            [vis, edge, depth, seg] => Ok(Self {
                vis: *vis,
                edge: *edge,
                depth: *depth,
                seg: *seg,
            }),
            _ => Err(format!(
                "expected 4 comma-separated weights (vis,edge,depth,seg), got {}",
                values.len()
            )),
        }
    }

    fn all(&self) -> [(&'static str, f64); 4] {
        [
            ("vis", self.vis),
            ("edge", self.edge),
            ("depth", self.depth),
            ("seg", self.seg),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub weights: ControlWeights,
    pub num_steps: u32,
    pub guidance: f64,
    pub seed: u64,
    pub sigma_max: f64,
    pub blur_strength: String,
    pub canny_threshold: String,
    pub fps: u32,
    pub upscale: bool,
    pub upscale_weight: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            weights: ControlWeights::default(),
            num_steps: 35,
            guidance: 7.0,
            seed: 1,
            sigma_max: 70.0,
            blur_strength: "medium".to_string(),
            canny_threshold: "medium".to_string(),
            fps: 24,
            upscale: false,
            upscale_weight: 0.5,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, weight) in self.weights.all() {
            if !(0.0..=1.0).contains(&weight) {
                return Err(format!("{} weight {} is outside [0, 1]", name, weight));
            }
        }
        if self.num_steps == 0 {
            return Err("num_steps must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.upscale_weight) {
            return Err(format!(
                "upscale weight {} is outside [0, 1]",
                self.upscale_weight
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub prompt_id: String,
    pub model_type: ModelType,
    pub status: RunStatus,
    pub execution_config: ExecutionConfig,
    pub outputs: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn output_path(&self) -> Option<&str> {
        self.outputs.get(OUTPUT_PATH_KEY).and_then(Value::as_str)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.outputs.get(ERROR_KEY).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub prompt_id: String,
    pub execution_config: ExecutionConfig,
    pub metadata: Map<String, Value>,
}

/// Fields written together by a single status transition.
#[derive(Debug, Clone)]
pub struct RunUpdate {
    pub status: RunStatus,
    pub outputs: Option<Map<String, Value>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub model_type: Option<ModelType>,
    pub prompt_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptFilter {
    pub model_type: Option<ModelType>,
    pub limit: Option<usize>,
}
