//! Connection & dispatch layer (§4.1): handshake, auth gate, and the
//! message dispatch table. Wires together the connection table, session
//! index, lock table, agent invoker, recipe orchestrator and workstream
//! store behind a single entry point, [`Dispatcher::handle_message`].

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use voicecode_protocol::commands::general_commands;
use voicecode_protocol::messages::ClientMessage;
use voicecode_protocol::messages::ResourceEntry as WireResourceEntry;
use voicecode_protocol::messages::ServerMessage;
use voicecode_protocol::messages::WorkstreamSummary;
use voicecode_protocol::session::SessionSummary;

use crate::agent_invoker::AgentInvoker;
use crate::agent_invoker::SessionRef;
use crate::connection::ConnectionId;
use crate::connection::ConnectionTable;
use crate::lock_table::SessionLockTable;
use crate::recipe::OrchestrationSink;
use crate::recipe::Recipe;
use crate::recipe::RecipeOrchestrator;
use crate::recipe::WorkstreamLinkage;
use crate::resources;
use crate::session_index::canonicalize_session_id;
use crate::session_index::SessionIndex;
use crate::session_index::SessionMetadata;
use crate::watcher::read_full_history;
use crate::watcher::FilePositionTable;
use crate::watcher::ReplicationSink;
use crate::workstream::WorkstreamStore;

const PROTOCOL_VERSION: &str = "1";
const AUTH_VERSION: &str = "1";
const HELLO_INSTRUCTIONS: &str = "send connect {api_key} to authenticate";

/// Everything one dispatch call needs, grouped so `Dispatcher` can be
/// cheaply cloned into the tasks that own each connection's socket.
#[derive(Clone)]
pub struct Dispatcher {
    connections: ConnectionTable,
    session_index: SessionIndex,
    positions: FilePositionTable,
    lock_table: SessionLockTable,
    agent: AgentInvoker,
    orchestrator: Arc<RecipeOrchestrator>,
    workstreams: Arc<dyn WorkstreamStore>,
    recipes: Arc<HashMap<String, Recipe>>,
    api_key: Arc<str>,
}

impl Dispatcher {
    pub fn new(
        connections: ConnectionTable,
        session_index: SessionIndex,
        positions: FilePositionTable,
        lock_table: SessionLockTable,
        agent: AgentInvoker,
        workstreams: Arc<dyn WorkstreamStore>,
        recipes: HashMap<String, Recipe>,
        api_key: String,
    ) -> Self {
        let orchestrator = Arc::new(RecipeOrchestrator::new(
            crate::recipe::OrchestrationTable::new(),
            lock_table.clone(),
            agent.clone(),
        ));
        Self {
            connections,
            session_index,
            positions,
            lock_table,
            agent,
            orchestrator,
            workstreams,
            recipes: Arc::new(recipes),
            api_key: api_key.into(),
        }
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    /// Constant-time key check for the short-lived upload channel (§4.6),
    /// which authenticates per-request via a bearer token rather than the
    /// framed `connect` handshake.
    pub fn authenticate_key(&self, candidate: &str) -> bool {
        crate::auth::keys_match(candidate, &self.api_key)
    }

    pub fn hello() -> ServerMessage {
        ServerMessage::Hello {
            version: PROTOCOL_VERSION.to_string(),
            auth_version: AUTH_VERSION.to_string(),
            instructions: HELLO_INSTRUCTIONS.to_string(),
        }
    }

    fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.connections
            .mutate(id, |c| c.authenticated)
            .unwrap_or(false)
    }

    fn send_to(&self, id: ConnectionId, message: ServerMessage) {
        self.connections.mutate(id, |c| c.send(message));
    }

    /// Entry point the transport-owning task calls for every decoded frame
    /// (§4.1 "Dispatch table"). Unauthenticated connections may only send
    /// `ping`/`connect`; anything else closes the channel after
    /// `auth_error`, signalled by the `bool` return (`false` ⇒ caller
    /// should close the transport).
    pub async fn handle_message(&self, id: ConnectionId, message: ClientMessage) -> bool {
        if !self.is_authenticated(id) && !matches!(message, ClientMessage::Ping | ClientMessage::Connect { .. }) {
            self.send_to(
                id,
                ServerMessage::AuthError {
                    message: "Authentication failed".to_string(),
                },
            );
            return false;
        }

        match message {
            ClientMessage::Ping => {
                self.send_to(id, ServerMessage::Pong);
                true
            }
            ClientMessage::Connect {
                api_key,
                session_id,
                recent_sessions_limit,
            } => self.handle_connect(id, api_key, session_id, recent_sessions_limit),
            ClientMessage::Subscribe { session_id } => {
                self.handle_subscribe(id, &session_id);
                true
            }
            ClientMessage::Unsubscribe { session_id } => {
                self.connections.mutate(id, |c| {
                    c.subscribed_session_ids.remove(&session_id);
                });
                true
            }
            ClientMessage::Prompt {
                new_session_id,
                resume_session_id,
                workstream_id,
                text,
                working_directory,
                message_id,
            } => {
                self.handle_prompt(
                    id,
                    new_session_id,
                    resume_session_id,
                    workstream_id,
                    text,
                    working_directory,
                    message_id,
                )
                .await;
                true
            }
            ClientMessage::ClearContext { workstream_id } => {
                let previous = self.workstreams.unlink_active_session(&workstream_id);
                self.connections.broadcast(ServerMessage::ContextCleared {
                    workstream_id,
                    previous_claude_session_id: previous,
                });
                true
            }
            ClientMessage::SetDirectory { working_directory } => {
                self.connections.mutate(id, |c| {
                    c.working_directory = Some(working_directory.clone());
                });
                self.send_to(id, self.available_commands_message(&working_directory));
                true
            }
            ClientMessage::SessionDeleted { session_id } => {
                self.connections.mutate(id, |c| {
                    c.deleted_sessions.insert(session_id);
                });
                true
            }
            ClientMessage::CompactSession { session_id } => {
                self.handle_compact(id, session_id).await;
                true
            }
            ClientMessage::UploadFile {
                filename,
                content,
                storage_location,
            } => {
                self.handle_upload(id, &storage_location, &filename, &content);
                true
            }
            ClientMessage::ListResources { storage_location } => {
                self.handle_list_resources(id, &storage_location);
                true
            }
            ClientMessage::DeleteResource {
                storage_location,
                filename,
            } => {
                self.handle_delete_resource(id, &storage_location, &filename);
                true
            }
            ClientMessage::StartRecipe {
                recipe_id,
                session_id,
                working_directory,
            } => {
                self.handle_start_recipe(id, recipe_id, session_id, working_directory)
                    .await;
                true
            }
            ClientMessage::RefreshSessions => {
                self.push_session_lists(id);
                true
            }
            ClientMessage::GetAvailableRecipes => {
                self.send_to(id, self.available_recipes_message());
                true
            }
            ClientMessage::CreateWorkstream {
                name,
                working_directory,
            } => {
                let workstream = self.workstreams.create(name, working_directory);
                self.connections
                    .broadcast(workstream_created_message(&workstream));
                true
            }
            ClientMessage::WorkstreamUpdated { workstream_id, name } => {
                if let Some(workstream) = self.workstreams.rename(&workstream_id, name) {
                    self.connections
                        .broadcast(workstream_updated_message(&workstream));
                }
                true
            }
            ClientMessage::WorkstreamList => {
                self.send_to(id, self.workstream_list_message());
                true
            }
        }
    }

    fn handle_connect(
        &self,
        id: ConnectionId,
        api_key: String,
        _session_id: Option<String>,
        recent_sessions_limit: Option<u32>,
    ) -> bool {
        if !crate::auth::keys_match(&api_key, &self.api_key) {
            self.send_to(
                id,
                ServerMessage::AuthError {
                    message: "Authentication failed".to_string(),
                },
            );
            return false;
        }

        self.connections.mutate(id, |c| {
            c.authenticated = true;
            if let Some(limit) = recent_sessions_limit {
                c.recent_sessions_limit = limit;
            }
        });

        self.push_session_lists(id);
        let working_directory = self
            .connections
            .mutate(id, |c| c.working_directory.clone())
            .flatten()
            .unwrap_or_default();
        self.send_to(id, self.available_commands_message(&working_directory));
        true
    }

    fn push_session_lists(&self, id: ConnectionId) {
        let all = self.session_index.all();
        let sessions: Vec<SessionSummary> = all.iter().map(summary_of).collect();
        let total_count = sessions.len();
        self.send_to(
            id,
            ServerMessage::SessionList {
                sessions,
                total_count,
            },
        );

        let limit = self
            .connections
            .mutate(id, |c| c.recent_sessions_limit)
            .unwrap_or(5) as usize;
        let mut recent = all;
        recent.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        recent.truncate(limit);
        self.send_to(
            id,
            ServerMessage::RecentSessions {
                sessions: recent.iter().map(recent_summary_of).collect(),
                limit,
            },
        );
    }

    fn available_commands_message(&self, working_directory: &str) -> ServerMessage {
        let project_commands = crate::project_commands::discover(Path::new(working_directory));
        ServerMessage::AvailableCommands {
            working_directory: working_directory.to_string(),
            project_commands,
            general_commands: general_commands(),
        }
    }

    fn available_recipes_message(&self) -> ServerMessage {
        ServerMessage::AvailableRecipes {
            recipes: self
                .recipes
                .values()
                .map(|r| voicecode_protocol::messages::RecipeSummary {
                    id: r.id.clone(),
                    initial_step: r.initial_step.clone(),
                    steps: r.steps.keys().cloned().collect(),
                })
                .collect(),
        }
    }

    fn workstream_list_message(&self) -> ServerMessage {
        ServerMessage::WorkstreamList {
            workstreams: self.workstreams.list().iter().map(workstream_summary).collect(),
        }
    }

    fn handle_subscribe(&self, id: ConnectionId, session_id: &str) {
        self.connections.mutate(id, |c| {
            c.subscribed_session_ids.insert(session_id.to_string());
        });

        let Some(metadata) = self.session_index.get(session_id) else {
            return;
        };
        self.positions.reset(&metadata.file_path);
        let size = match std::fs::metadata(&metadata.file_path) {
            Ok(m) => m.len(),
            Err(_) => return,
        };
        self.positions.set(&metadata.file_path, size);

        let Ok(history) = read_full_history(&metadata.file_path) else {
            return;
        };
        self.send_to(
            id,
            ServerMessage::SessionUpdated {
                session_id: metadata.session_id,
                name: Some(metadata.name),
                working_directory: metadata.working_directory,
                last_modified: format_timestamp(metadata.last_modified),
                message_count: metadata.message_count,
                messages: history,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_prompt(
        &self,
        id: ConnectionId,
        new_session_id: Option<String>,
        resume_session_id: Option<String>,
        workstream_id: Option<String>,
        text: String,
        working_directory: Option<String>,
        message_id: Option<String>,
    ) {
        let resolved = match self.resolve_prompt_target(new_session_id, resume_session_id, workstream_id, working_directory) {
            Ok(r) => r,
            Err(e) => {
                self.send_to(
                    id,
                    ServerMessage::Error {
                        message: e,
                        session_id: None,
                    },
                );
                return;
            }
        };

        let Some(guard) = self.lock_table.acquire(&resolved.session_id) else {
            self.send_to(
                id,
                ServerMessage::SessionLocked {
                    session_id: resolved.session_id,
                    message: "a recipe or prompt is already running for this session".to_string(),
                },
            );
            return;
        };

        self.connections.mutate(id, |c| {
            c.subscribed_session_ids.insert(resolved.session_id.clone());
        });

        self.send_to(
            id,
            ServerMessage::Ack {
                session_id: resolved.session_id.clone(),
                message_id,
            },
        );

        let reply = self
            .agent
            .invoke(&resolved.session_ref, &text, None, &resolved.cwd)
            .await;

        match reply {
            Ok(r) if r.success => {
                self.connections.broadcast_for_session(
                    &resolved.session_id,
                    ServerMessage::Response {
                        session_id: resolved.session_id.clone(),
                        text: r.result.unwrap_or_default(),
                        usage: None,
                        cost: None,
                    },
                );
            }
            Ok(r) => {
                self.connections.broadcast_for_session(
                    &resolved.session_id,
                    ServerMessage::Error {
                        message: r.error.unwrap_or_else(|| "agent invocation failed".to_string()),
                        session_id: Some(resolved.session_id.clone()),
                    },
                );
            }
            Err(e) => {
                self.connections.broadcast_for_session(
                    &resolved.session_id,
                    ServerMessage::Error {
                        message: e.to_string(),
                        session_id: Some(resolved.session_id.clone()),
                    },
                );
            }
        }

        self.connections.broadcast_for_session(
            &resolved.session_id,
            ServerMessage::TurnComplete {
                session_id: resolved.session_id,
            },
        );
        guard.release();
    }

    fn resolve_prompt_target(
        &self,
        new_session_id: Option<String>,
        resume_session_id: Option<String>,
        workstream_id: Option<String>,
        working_directory: Option<String>,
    ) -> Result<PromptTarget, String> {
        let provided = [new_session_id.is_some(), resume_session_id.is_some(), workstream_id.is_some()]
            .iter()
            .filter(|b| **b)
            .count();
        if provided != 1 {
            return Err("prompt must set exactly one of new_session_id, resume_session_id, workstream_id".to_string());
        }

        if let Some(id) = new_session_id {
            let working_directory = working_directory
                .ok_or_else(|| "new_session_id requires working_directory".to_string())?;
            return Ok(PromptTarget {
                session_id: id.clone(),
                session_ref: SessionRef::New(id),
                cwd: expand_tilde(&working_directory),
            });
        }

        if let Some(id) = resume_session_id {
            let cwd = self
                .session_index
                .get(&id)
                .map(|m| PathBuf::from(m.working_directory))
                .or_else(|| working_directory.map(|wd| expand_tilde(&wd)))
                .ok_or_else(|| format!("unknown session: {id}"))?;
            return Ok(PromptTarget {
                session_id: id.clone(),
                session_ref: SessionRef::Resume(id),
                cwd,
            });
        }

        let workstream_id = workstream_id.expect("exactly one of the three is set");
        let workstream = self
            .workstreams
            .get(&workstream_id)
            .ok_or_else(|| format!("unknown workstream: {workstream_id}"))?;

        match workstream.active_session_id {
            Some(session_id) => {
                let cwd = self
                    .session_index
                    .get(&session_id)
                    .map(|m| PathBuf::from(m.working_directory))
                    .or_else(|| workstream.working_directory.clone().map(|wd| expand_tilde(&wd)))
                    .unwrap_or_default();
                Ok(PromptTarget {
                    session_id: session_id.clone(),
                    session_ref: SessionRef::Resume(session_id),
                    cwd,
                })
            }
            None => {
                let cwd = workstream
                    .working_directory
                    .clone()
                    .map(|wd| expand_tilde(&wd))
                    .ok_or_else(|| "workstream has no stored working_directory".to_string())?;
                let session_id = uuid::Uuid::new_v4().to_string();
                self.workstreams
                    .set_active_session(&workstream_id, session_id.clone());
                Ok(PromptTarget {
                    session_id: session_id.clone(),
                    session_ref: SessionRef::New(session_id),
                    cwd,
                })
            }
        }
    }

    async fn handle_compact(&self, id: ConnectionId, session_id: String) {
        let Some(guard) = self.lock_table.acquire(&session_id) else {
            self.send_to(
                id,
                ServerMessage::SessionLocked {
                    session_id,
                    message: "a recipe or prompt is already running for this session".to_string(),
                },
            );
            return;
        };

        let cwd = self
            .session_index
            .get(&session_id)
            .map(|m| PathBuf::from(m.working_directory))
            .unwrap_or_default();

        let reply = self
            .agent
            .invoke(&SessionRef::Resume(session_id.clone()), "/compact", None, &cwd)
            .await;

        let message = match reply {
            Ok(r) if r.success => ServerMessage::CompactionComplete {
                session_id: session_id.clone(),
            },
            Ok(r) => ServerMessage::CompactionError {
                session_id: session_id.clone(),
                error: r.error.unwrap_or_else(|| "compaction failed".to_string()),
            },
            Err(e) => ServerMessage::CompactionError {
                session_id: session_id.clone(),
                error: e.to_string(),
            },
        };
        self.connections.broadcast_for_session(&session_id, message);
        guard.release();
    }

    fn handle_upload(&self, id: ConnectionId, storage_location: &str, filename: &str, content: &str) {
        match resources::upload(storage_location, filename, content, chrono::Utc::now()) {
            Ok(uploaded) => self.send_to(
                id,
                ServerMessage::FileUploaded {
                    success: true,
                    filename: uploaded.filename,
                    path: uploaded.path.display().to_string(),
                    size: uploaded.size,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                },
            ),
            Err(e) => self.send_to(
                id,
                ServerMessage::Error {
                    message: e.to_string(),
                    session_id: None,
                },
            ),
        }
    }

    fn handle_list_resources(&self, id: ConnectionId, storage_location: &str) {
        match resources::list(storage_location) {
            Ok(entries) => self.send_to(
                id,
                ServerMessage::ResourcesList {
                    resources: entries
                        .into_iter()
                        .map(|e| WireResourceEntry {
                            filename: e.filename,
                            path: e.path.display().to_string(),
                            size: e.size,
                        })
                        .collect(),
                },
            ),
            Err(e) => self.send_to(
                id,
                ServerMessage::Error {
                    message: e.to_string(),
                    session_id: None,
                },
            ),
        }
    }

    fn handle_delete_resource(&self, id: ConnectionId, storage_location: &str, filename: &str) {
        match resources::delete(storage_location, filename) {
            Ok(()) => self.send_to(
                id,
                ServerMessage::ResourceDeleted {
                    filename: filename.to_string(),
                },
            ),
            Err(e) => self.send_to(
                id,
                ServerMessage::Error {
                    message: e.to_string(),
                    session_id: None,
                },
            ),
        }
    }

    async fn handle_start_recipe(
        &self,
        id: ConnectionId,
        recipe_id: String,
        session_id: String,
        working_directory: Option<String>,
    ) {
        let Some(recipe) = self.recipes.get(&recipe_id).cloned() else {
            self.send_to(
                id,
                ServerMessage::Error {
                    message: format!("unknown recipe: {recipe_id}"),
                    session_id: Some(session_id),
                },
            );
            return;
        };

        let existing = self.session_index.get(&session_id);
        let (session_ref, cwd, session_created) = match existing {
            Some(metadata) => (
                SessionRef::Resume(session_id.clone()),
                PathBuf::from(metadata.working_directory),
                false,
            ),
            None => {
                let Some(working_directory) = working_directory else {
                    self.send_to(
                        id,
                        ServerMessage::Error {
                            message: "start_recipe on a new session requires working_directory".to_string(),
                            session_id: Some(session_id),
                        },
                    );
                    return;
                };
                (
                    SessionRef::New(session_id.clone()),
                    expand_tilde(&working_directory),
                    true,
                )
            }
        };

        self.connections.mutate(id, |c| {
            c.subscribed_session_ids.insert(session_id.clone());
        });

        let linkage = self.workstreams.clone();
        self.orchestrator
            .start_recipe(
                &recipe,
                &session_id,
                &session_ref,
                &cwd,
                session_created,
                self,
                Some(linkage.as_ref() as &dyn WorkstreamLinkage),
            )
            .await;
    }
}

/// `WorkstreamStore` implementors already get `WorkstreamLinkage` via the
/// blanket impl in `workstream.rs`, but that covers concrete types, not the
/// `dyn WorkstreamStore` trait object the dispatcher actually holds.
impl WorkstreamLinkage for dyn WorkstreamStore {
    fn workstream_for_session(&self, session_id: &str) -> Option<String> {
        self.find_by_session(session_id)
    }

    fn unlink(&self, workstream_id: &str) -> Option<String> {
        self.unlink_active_session(workstream_id)
    }
}

struct PromptTarget {
    session_id: String,
    session_ref: SessionRef,
    cwd: PathBuf,
}

fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(raw)
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn summary_of(metadata: &SessionMetadata) -> SessionSummary {
    SessionSummary {
        session_id: metadata.session_id.clone(),
        name: Some(metadata.name.clone()),
        working_directory: metadata.working_directory.clone(),
        last_modified: format_timestamp(metadata.last_modified),
        message_count: metadata.message_count,
        preview: metadata.preview.clone(),
        workstream_id: metadata.workstream_id.clone(),
    }
}

/// `recent_sessions` entries omit the display name; the client supplies
/// its own (§6 "canonical contract").
fn recent_summary_of(metadata: &SessionMetadata) -> SessionSummary {
    SessionSummary {
        name: None,
        ..summary_of(metadata)
    }
}

fn workstream_summary(w: &crate::workstream::Workstream) -> WorkstreamSummary {
    WorkstreamSummary {
        workstream_id: w.workstream_id.clone(),
        name: w.name.clone(),
        active_claude_session_id: w.active_session_id.clone(),
    }
}

fn workstream_created_message(w: &crate::workstream::Workstream) -> ServerMessage {
    ServerMessage::WorkstreamCreated {
        workstream_id: w.workstream_id.clone(),
        name: w.name.clone(),
        active_claude_session_id: w.active_session_id.clone(),
    }
}

fn workstream_updated_message(w: &crate::workstream::Workstream) -> ServerMessage {
    ServerMessage::WorkstreamUpdated {
        workstream_id: w.workstream_id.clone(),
        name: w.name.clone(),
        active_claude_session_id: w.active_session_id.clone(),
    }
}

impl ReplicationSink for Dispatcher {
    fn on_session_created(&self, metadata: SessionMetadata) {
        self.connections.broadcast_for_session(
            &metadata.session_id,
            ServerMessage::SessionCreated {
                session_id: metadata.session_id.clone(),
                name: Some(metadata.name.clone()),
                working_directory: metadata.working_directory.clone(),
                last_modified: format_timestamp(metadata.last_modified),
                message_count: metadata.message_count,
            },
        );
    }

    fn on_session_updated(&self, session_id: &str, messages: Vec<voicecode_protocol::session::MessageRecord>) {
        let Some(metadata) = self.session_index.get(session_id) else {
            return;
        };
        self.connections.broadcast_for_session(
            session_id,
            ServerMessage::SessionUpdated {
                session_id: metadata.session_id,
                name: Some(metadata.name),
                working_directory: metadata.working_directory,
                last_modified: format_timestamp(metadata.last_modified),
                message_count: metadata.message_count,
                messages,
            },
        );
    }
}

impl OrchestrationSink for Dispatcher {
    fn recipe_started(&self, session_id: &str, recipe_id: &str, step: &str) {
        self.connections.broadcast_for_session(
            session_id,
            ServerMessage::RecipeStarted {
                session_id: session_id.to_string(),
                recipe_id: recipe_id.to_string(),
                step: step.to_string(),
            },
        );
    }

    fn recipe_step_transition(&self, session_id: &str, from_step: &str, to_step: &str, outcome: &str) {
        self.connections.broadcast_for_session(
            session_id,
            ServerMessage::RecipeStepTransition {
                session_id: session_id.to_string(),
                from_step: from_step.to_string(),
                to_step: to_step.to_string(),
                outcome: outcome.to_string(),
            },
        );
    }

    fn recipe_exited(&self, session_id: &str, reason: &str) {
        self.connections.broadcast_for_session(
            session_id,
            ServerMessage::RecipeExited {
                session_id: session_id.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    fn orchestration_retry(&self, session_id: &str, step: &str) {
        self.connections.broadcast_for_session(
            session_id,
            ServerMessage::OrchestrationRetry {
                session_id: session_id.to_string(),
                step: step.to_string(),
            },
        );
    }

    fn context_cleared(&self, workstream_id: &str, previous_session_id: Option<&str>) {
        self.connections.broadcast(ServerMessage::ContextCleared {
            workstream_id: workstream_id.to_string(),
            previous_claude_session_id: previous_session_id.map(str::to_string),
        });
    }

    fn turn_complete(&self, session_id: &str) {
        self.connections.broadcast_for_session(
            session_id,
            ServerMessage::TurnComplete {
                session_id: session_id.to_string(),
            },
        );
    }

    fn session_locked(&self, session_id: &str, message: &str) {
        self.connections.broadcast_for_session(
            session_id,
            ServerMessage::SessionLocked {
                session_id: session_id.to_string(),
                message: message.to_string(),
            },
        );
    }
}

/// Check a raw session-id string's shape without requiring it to already
/// be indexed — used by callers that need to validate a frame field before
/// any lookup (kept here rather than re-exported from `session_index` so
/// dispatch-layer validation has one obvious home).
pub fn is_plausible_session_id(raw: &str) -> bool {
    canonicalize_session_id(raw).is_some()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::workstream::InMemoryWorkstreamStore;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn test_dispatcher(agent_executable: &str) -> (Dispatcher, tokio::sync::mpsc::UnboundedReceiver<ServerMessage>, ConnectionId) {
        let connections = ConnectionTable::new();
        let (tx, rx) = unbounded_channel();
        let id = ConnectionId::next();
        connections.insert(crate::connection::Connection::new(id, tx));

        let dispatcher = Dispatcher::new(
            connections,
            SessionIndex::new(),
            FilePositionTable::new(),
            SessionLockTable::new(),
            AgentInvoker::new(agent_executable.to_string(), Duration::from_secs(5)),
            Arc::new(InMemoryWorkstreamStore::new()),
            HashMap::from([(
                "implement-and-review".to_string(),
                crate::recipe::implement_and_review(),
            )]),
            "voice-code-00000000000000000000000000000000".to_string(),
        );
        (dispatcher, rx, id)
    }

    #[tokio::test]
    async fn ping_is_answered_without_authentication() {
        let (dispatcher, mut rx, id) = test_dispatcher("true");
        let ok = dispatcher.handle_message(id, ClientMessage::Ping).await;
        assert!(ok);
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Pong);
    }

    #[tokio::test]
    async fn unauthenticated_prompt_is_rejected_and_signals_close() {
        let (dispatcher, mut rx, id) = test_dispatcher("true");
        let ok = dispatcher
            .handle_message(
                id,
                ClientMessage::Prompt {
                    new_session_id: Some("s1".to_string()),
                    resume_session_id: None,
                    workstream_id: None,
                    text: "hi".to_string(),
                    working_directory: Some("/tmp".to_string()),
                    message_id: None,
                },
            )
            .await;
        assert!(!ok);
        match rx.try_recv().unwrap() {
            ServerMessage::AuthError { message } => assert_eq!(message, "Authentication failed"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_key_is_rejected_with_the_generic_message() {
        let (dispatcher, mut rx, id) = test_dispatcher("true");
        let ok = dispatcher
            .handle_message(
                id,
                ClientMessage::Connect {
                    api_key: "voice-code-ffffffffffffffffffffffffffffffff".to_string(),
                    session_id: None,
                    recent_sessions_limit: None,
                },
            )
            .await;
        assert!(!ok);
        match rx.try_recv().unwrap() {
            ServerMessage::AuthError { message } => assert_eq!(message, "Authentication failed"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_connect_pushes_handshake_sequence_in_order() {
        let (dispatcher, mut rx, id) = test_dispatcher("true");
        let ok = dispatcher
            .handle_message(
                id,
                ClientMessage::Connect {
                    api_key: "voice-code-00000000000000000000000000000000".to_string(),
                    session_id: None,
                    recent_sessions_limit: None,
                },
            )
            .await;
        assert!(ok);
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::SessionList { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::RecentSessions { .. }));
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::AvailableCommands { .. }));
    }

    #[tokio::test]
    async fn prompt_with_both_new_and_resume_session_id_is_rejected() {
        let (dispatcher, mut rx, id) = test_dispatcher("true");
        dispatcher
            .handle_message(
                id,
                ClientMessage::Connect {
                    api_key: "voice-code-00000000000000000000000000000000".to_string(),
                    session_id: None,
                    recent_sessions_limit: None,
                },
            )
            .await;
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        dispatcher
            .handle_message(
                id,
                ClientMessage::Prompt {
                    new_session_id: Some("s1".to_string()),
                    resume_session_id: Some("s2".to_string()),
                    workstream_id: None,
                    text: "hi".to_string(),
                    working_directory: Some("/tmp".to_string()),
                    message_id: None,
                },
            )
            .await;
        match rx.try_recv().unwrap() {
            ServerMessage::Error { message, .. } => assert!(message.contains("exactly one")),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    /// A fake agent binary that ignores its CLI flags entirely and prints a
    /// well-formed `--output-format json` reply envelope, so the happy-path
    /// prompt flow can be exercised without the real agent.
    fn fake_agent_script() -> tempfile::TempPath {
        let script = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            script.path(),
            "#!/bin/sh\ncat >/dev/null\necho '[{\"type\":\"result\",\"result\":\"done\",\"session_id\":\"s1\"}]'\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(script.path(), std::fs::Permissions::from_mode(0o700)).unwrap();
        }
        script.into_temp_path()
    }

    #[tokio::test]
    async fn happy_path_prompt_acks_then_responds_then_completes() {
        let script = fake_agent_script();
        let (dispatcher, mut rx, id) = test_dispatcher(script.to_str().unwrap());
        dispatcher
            .handle_message(
                id,
                ClientMessage::Connect {
                    api_key: "voice-code-00000000000000000000000000000000".to_string(),
                    session_id: None,
                    recent_sessions_limit: None,
                },
            )
            .await;
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        dispatcher
            .handle_message(
                id,
                ClientMessage::Prompt {
                    new_session_id: Some("s1".to_string()),
                    resume_session_id: None,
                    workstream_id: None,
                    text: "hi".to_string(),
                    working_directory: Some("/tmp".to_string()),
                    message_id: Some("m1".to_string()),
                },
            )
            .await;

        match rx.try_recv().unwrap() {
            ServerMessage::Ack { session_id, message_id } => {
                assert_eq!(session_id, "s1");
                assert_eq!(message_id.as_deref(), Some("m1"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            ServerMessage::Response { session_id, text, .. } => {
                assert_eq!(session_id, "s1");
                assert_eq!(text, "done");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            ServerMessage::TurnComplete { session_id } => assert_eq!(session_id, "s1"),
            other => panic!("unexpected message: {other:?}"),
        }

        // the lock is released once the turn completes, so the same session
        // can immediately take another prompt.
        assert!(dispatcher.lock_table.acquire("s1").is_some());
    }

    #[tokio::test]
    async fn second_prompt_on_the_same_session_is_denied_while_first_holds_the_lock() {
        let (dispatcher, mut rx, id) = test_dispatcher("sleep");
        dispatcher
            .handle_message(
                id,
                ClientMessage::Connect {
                    api_key: "voice-code-00000000000000000000000000000000".to_string(),
                    session_id: None,
                    recent_sessions_limit: None,
                },
            )
            .await;
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();
        rx.try_recv().unwrap();

        let _held = dispatcher.lock_table.acquire("s1").unwrap();
        dispatcher
            .handle_message(
                id,
                ClientMessage::Prompt {
                    new_session_id: Some("s1".to_string()),
                    resume_session_id: None,
                    workstream_id: None,
                    text: "hi".to_string(),
                    working_directory: Some("/tmp".to_string()),
                    message_id: None,
                },
            )
            .await;
        match rx.try_recv().unwrap() {
            ServerMessage::SessionLocked { session_id, .. } => assert_eq!(session_id, "s1"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
