//! Recipe orchestrator: a declarative finite-state machine that drives
//! multi-step agent conversations by parsing outcome tokens out of each
//! reply (§4.5).

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::RwLock;

use serde::Deserialize;

use crate::agent_invoker::AgentInvoker;
use crate::agent_invoker::SessionRef;
use crate::lock_table::SessionLockTable;

const VALID_MODELS: [&str; 3] = ["haiku", "sonnet", "opus"];

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Next(String),
    Exit(String),
}

#[derive(Debug, Clone)]
pub struct RecipeStep {
    pub prompt: String,
    pub outcomes: HashSet<String>,
    pub on_outcome: HashMap<String, Transition>,
    pub model: Option<String>,
    pub fresh_context: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Guardrails {
    pub max_step_visits: u32,
    pub max_total_steps: u32,
}

#[derive(Debug, Clone)]
pub struct Recipe {
    pub id: String,
    pub initial_step: String,
    pub steps: HashMap<String, RecipeStep>,
    pub guardrails: Guardrails,
    pub model: Option<String>,
}

impl Recipe {
    /// Check every cross-reference named in §4.5 "Validation". Any
    /// violation disqualifies the recipe from being offered.
    pub fn validate(&self) -> Result<(), String> {
        if !self.steps.contains_key(&self.initial_step) {
            return Err(format!("initial step {} does not exist", self.initial_step));
        }
        validate_model(&self.model)?;
        for (name, step) in &self.steps {
            validate_model(&step.model)?;
            for (outcome, transition) in &step.on_outcome {
                if !step.outcomes.contains(outcome) {
                    return Err(format!("step {name}: outcome {outcome} not declared"));
                }
                if let Transition::Next(next) = transition {
                    if !self.steps.contains_key(next) {
                        return Err(format!("step {name}: next_step {next} does not exist"));
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_model(model: &Option<String>) -> Result<(), String> {
    match model {
        None => Ok(()),
        Some(m) if VALID_MODELS.contains(&m.as_str()) => Ok(()),
        Some(m) => Err(format!("invalid model: {m}")),
    }
}

/// The bundled `implement-and-review` recipe (§4.5).
pub fn implement_and_review() -> Recipe {
    let mut steps = HashMap::new();
    steps.insert(
        "implement".to_string(),
        RecipeStep {
            prompt: "Implement the requested change.".to_string(),
            outcomes: ["complete"].into_iter().map(String::from).collect(),
            on_outcome: HashMap::from([(
                "complete".to_string(),
                Transition::Next("code-review".to_string()),
            )]),
            model: None,
            fresh_context: false,
        },
    );
    steps.insert(
        "code-review".to_string(),
        RecipeStep {
            prompt: "Review the change for correctness and style.".to_string(),
            outcomes: ["issues-found", "complete"].into_iter().map(String::from).collect(),
            on_outcome: HashMap::from([
                ("issues-found".to_string(), Transition::Next("fix".to_string())),
                ("complete".to_string(), Transition::Next("commit".to_string())),
            ]),
            model: None,
            fresh_context: false,
        },
    );
    steps.insert(
        "fix".to_string(),
        RecipeStep {
            prompt: "Address the issues raised in review.".to_string(),
            outcomes: ["complete"].into_iter().map(String::from).collect(),
            on_outcome: HashMap::from([(
                "complete".to_string(),
                Transition::Next("code-review".to_string()),
            )]),
            model: None,
            fresh_context: false,
        },
    );
    steps.insert(
        "commit".to_string(),
        RecipeStep {
            prompt: "Commit the change with a clear, descriptive message.".to_string(),
            outcomes: ["complete"].into_iter().map(String::from).collect(),
            on_outcome: HashMap::from([(
                "complete".to_string(),
                Transition::Exit("done".to_string()),
            )]),
            model: Some("haiku".to_string()),
            fresh_context: false,
        },
    );

    Recipe {
        id: "implement-and-review".to_string(),
        initial_step: "implement".to_string(),
        steps,
        guardrails: Guardrails {
            max_step_visits: 3,
            max_total_steps: 20,
        },
        model: None,
    }
}

/// Per-session orchestration bookkeeping (§3 "OrchestrationState").
#[derive(Debug, Clone)]
pub struct OrchestrationState {
    pub recipe_id: String,
    pub current_step: String,
    pub step_count: u32,
    pub step_visit_counts: HashMap<String, u32>,
    pub step_retry_counts: HashMap<String, u32>,
    pub session_created: bool,
}

impl OrchestrationState {
    fn new(recipe_id: String, initial_step: String, session_created: bool) -> Self {
        let mut step_visit_counts = HashMap::new();
        step_visit_counts.insert(initial_step.clone(), 1);
        Self {
            recipe_id,
            current_step: initial_step,
            step_count: 0,
            step_visit_counts,
            step_retry_counts: HashMap::new(),
            session_created,
        }
    }
}

#[derive(Clone, Default)]
pub struct OrchestrationTable {
    inner: Arc<RwLock<HashMap<String, OrchestrationState>>>,
}

impl OrchestrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, OrchestrationState>> {
        self.inner.read().expect("orchestration table lock poisoned")
    }

    #[allow(clippy::expect_used)]
    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, OrchestrationState>> {
        self.inner.write().expect("orchestration table lock poisoned")
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.read().contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<OrchestrationState> {
        self.read().get(session_id).cloned()
    }
}

/// Deserialized shape for loading a recipe from disk (§9: recipes are data
/// loaded at startup, not baked into the state machine).
#[derive(Debug, Deserialize)]
struct RecipeFile {
    id: String,
    initial_step: String,
    model: Option<String>,
    guardrails: GuardrailsFile,
    steps: HashMap<String, RecipeStepFile>,
}

#[derive(Debug, Deserialize)]
struct GuardrailsFile {
    max_step_visits: u32,
    max_total_steps: u32,
}

#[derive(Debug, Deserialize)]
struct RecipeStepFile {
    prompt: String,
    outcomes: Vec<String>,
    on_outcome: HashMap<String, TransitionFile>,
    model: Option<String>,
    #[serde(default)]
    fresh_context: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TransitionFile {
    Next { next_step: String },
    Exit { action: ExitMarker, reason: String },
}

#[derive(Debug, Deserialize)]
enum ExitMarker {
    #[serde(rename = "exit")]
    Exit,
}

impl From<RecipeFile> for Recipe {
    fn from(file: RecipeFile) -> Self {
        let steps = file
            .steps
            .into_iter()
            .map(|(name, step)| {
                let on_outcome = step
                    .on_outcome
                    .into_iter()
                    .map(|(outcome, transition)| {
                        let transition = match transition {
                            TransitionFile::Next { next_step } => Transition::Next(next_step),
                            TransitionFile::Exit { reason, .. } => Transition::Exit(reason),
                        };
                        (outcome, transition)
                    })
                    .collect();
                (
                    name,
                    RecipeStep {
                        prompt: step.prompt,
                        outcomes: step.outcomes.into_iter().collect(),
                        on_outcome,
                        model: step.model,
                        fresh_context: step.fresh_context,
                    },
                )
            })
            .collect();
        Recipe {
            id: file.id,
            initial_step: file.initial_step,
            steps,
            guardrails: Guardrails {
                max_step_visits: file.guardrails.max_step_visits,
                max_total_steps: file.guardrails.max_total_steps,
            },
            model: file.model,
        }
    }
}

/// Load and validate a recipe from a JSON file on disk. Invalid recipes
/// are rejected rather than silently degraded (§4.5 "Validation").
pub fn load_recipe_file(path: &Path) -> Result<Recipe, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let file: RecipeFile = serde_json::from_str(&contents).map_err(|e| e.to_string())?;
    let recipe: Recipe = file.into();
    recipe.validate()?;
    Ok(recipe)
}

/// Callbacks fired as a recipe run progresses (§6). Implemented by the
/// dispatch layer; a recording fake drives the unit tests below.
pub trait OrchestrationSink: Send + Sync {
    fn recipe_started(&self, session_id: &str, recipe_id: &str, step: &str);
    fn recipe_step_transition(&self, session_id: &str, from_step: &str, to_step: &str, outcome: &str);
    fn recipe_exited(&self, session_id: &str, reason: &str);
    fn orchestration_retry(&self, session_id: &str, step: &str);
    fn context_cleared(&self, workstream_id: &str, previous_session_id: Option<&str>);
    fn turn_complete(&self, session_id: &str);
    fn session_locked(&self, session_id: &str, message: &str);
}

/// Resolves the workstream linked to a session and unlinks it for
/// `fresh_context` steps. Implemented by the workstream store; kept as a
/// narrow trait here so this module has no dependency on it (§9 "Cycle
/// between invoker and orchestrator" applies equally to orchestrator vs.
/// workstream linkage).
pub trait WorkstreamLinkage: Send + Sync {
    fn workstream_for_session(&self, session_id: &str) -> Option<String>;
    fn unlink(&self, workstream_id: &str) -> Option<String>;
}

pub struct RecipeOrchestrator {
    states: OrchestrationTable,
    lock_table: SessionLockTable,
    agent: AgentInvoker,
}

impl RecipeOrchestrator {
    pub fn new(states: OrchestrationTable, lock_table: SessionLockTable, agent: AgentInvoker) -> Self {
        Self {
            states,
            lock_table,
            agent,
        }
    }

    pub fn states(&self) -> &OrchestrationTable {
        &self.states
    }

    /// Run `recipe` against `session_id` from its initial step through to
    /// an `:exit`, holding the session lock for the whole run (§4.5
    /// invariant). Denial and guardrail exits both emit exactly one
    /// `turn_complete`.
    pub async fn start_recipe(
        &self,
        recipe: &Recipe,
        session_id: &str,
        session_ref: &SessionRef,
        cwd: &Path,
        session_created: bool,
        sink: &dyn OrchestrationSink,
        linkage: Option<&dyn WorkstreamLinkage>,
    ) {
        let Some(guard) = self.lock_table.acquire(session_id) else {
            sink.session_locked(session_id, "a recipe or prompt is already running for this session");
            return;
        };

        self.states.write().insert(
            session_id.to_string(),
            OrchestrationState::new(recipe.id.clone(), recipe.initial_step.clone(), session_created),
        );

        sink.recipe_started(session_id, &recipe.id, &recipe.initial_step);

        let reason = self
            .drive(recipe, session_id, session_ref, cwd, sink, linkage)
            .await;

        self.states.write().remove(session_id);
        sink.recipe_exited(session_id, &reason);
        sink.turn_complete(session_id);
        guard.release();
    }

    async fn drive(
        &self,
        recipe: &Recipe,
        session_id: &str,
        session_ref: &SessionRef,
        cwd: &Path,
        sink: &dyn OrchestrationSink,
        linkage: Option<&dyn WorkstreamLinkage>,
    ) -> String {
        loop {
            let current_step = match self.states.get(session_id) {
                Some(state) => state.current_step.clone(),
                None => return "orchestration-error".to_string(),
            };
            let Some(step) = recipe.steps.get(&current_step) else {
                return "orchestration-error".to_string();
            };

            if step.fresh_context {
                if let Some(linkage) = linkage {
                    if let Some(workstream_id) = linkage.workstream_for_session(session_id) {
                        let previous = linkage.unlink(&workstream_id);
                        sink.context_cleared(&workstream_id, previous.as_deref());
                    }
                }
            }

            let retry_count = self
                .states
                .get(session_id)
                .and_then(|s| s.step_retry_counts.get(&current_step).copied())
                .unwrap_or(0);
            let model = step.model.clone().or_else(|| recipe.model.clone());
            let step_prompt = build_step_prompt(step, &current_step, retry_count);

            let reply = self
                .agent
                .invoke(session_ref, &step_prompt, model.as_deref(), cwd)
                .await;
            let raw_text = match reply {
                Ok(r) if r.success => r.result.unwrap_or_default(),
                Ok(r) => r.error.unwrap_or_default(),
                Err(e) => e.to_string(),
            };

            let outcome = extract_outcome(&raw_text).filter(|o| step.outcomes.contains(o));
            let Some(outcome) = outcome else {
                if retry_count < 1 {
                    let mut states = self.states.write();
                    if let Some(state) = states.get_mut(session_id) {
                        *state.step_retry_counts.entry(current_step.clone()).or_insert(0) += 1;
                    }
                    drop(states);
                    sink.orchestration_retry(session_id, &current_step);
                    continue;
                }
                return "orchestration-error".to_string();
            };

            let Some(transition) = step.on_outcome.get(&outcome) else {
                return "orchestration-error".to_string();
            };

            match transition {
                Transition::Exit(reason) => return reason.clone(),
                Transition::Next(next_step) => {
                    let mut states = self.states.write();
                    let Some(state) = states.get_mut(session_id) else {
                        return "orchestration-error".to_string();
                    };
                    state.step_retry_counts.remove(&current_step);
                    state.step_count += 1;
                    let visits = state
                        .step_visit_counts
                        .entry(next_step.clone())
                        .or_insert(0);
                    *visits += 1;
                    let step_count = state.step_count;
                    let visit_count = *visits;
                    state.current_step = next_step.clone();
                    drop(states);

                    sink.recipe_step_transition(session_id, &current_step, next_step, &outcome);

                    if step_count > recipe.guardrails.max_total_steps {
                        return "max-total-steps-exceeded".to_string();
                    }
                    if visit_count > recipe.guardrails.max_step_visits {
                        return format!("max-step-visits-exceeded:{next_step}");
                    }
                }
            }
        }
    }
}

fn build_step_prompt(step: &RecipeStep, step_name: &str, retry_count: u32) -> String {
    let outcomes = step.outcomes.iter().cloned().collect::<Vec<_>>().join(", ");
    let reminder = if retry_count > 0 {
        " Reminder: your previous reply did not include a JSON outcome object."
    } else {
        ""
    };
    format!(
        "{prompt}\n\nWhen you are finished, reply with a JSON object containing an \"outcome\" field set to one of: {outcomes}.{reminder} (step: {step_name})",
        prompt = step.prompt,
    )
}

/// Find the last JSON object in `text` that has an `outcome` string field
/// (§4.5 "Attempt to parse the agent's reply: find the last JSON object
/// containing an outcome key").
fn extract_outcome(text: &str) -> Option<String> {
    let mut last = None;
    let mut i = 0;
    let bytes = text.as_bytes();
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = matching_brace(bytes, i) {
                if let Some(candidate) = text.get(i..=end) {
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(candidate) {
                        if let Some(outcome) = value.get("outcome").and_then(|v| v.as_str()) {
                            last = Some(outcome.to_string());
                        }
                    }
                }
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    last
}

fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (idx, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}
