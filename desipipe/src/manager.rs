//! TaskManager and app declaration
//!
//! A [`TaskManager`] bundles a queue with the environment, scheduler and
//! provider configuration stamped into every task it submits. Apps are
//! registered explicitly by (name, source text, version): the source string
//! is the identity contract, not runtime introspection, so two processes
//! registering the same tuple produce the same task ids.
//!
//! Apps come in two flavors. A func app carries an in-process handler and
//! can only execute in worker processes that registered the same app. A bash
//! app is a command template, pure data, so any worker can render and
//! execute it from the task row alone.

use anyhow::Result;
use serde_json::Value;
use shared::{codec, hashing, TaskManagerConfig, TaskState};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use crate::queue::Queue;
use crate::task::{AppKind, Task, TaskFuture};

/// Decoded inputs of one task invocation.
#[derive(Debug, Clone, Default)]
pub struct TaskInput {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl TaskInput {
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

/// Captured output streams of a running task. Shared between the executing
/// handler and the heartbeat flusher.
#[derive(Debug, Default)]
pub struct OutputBuffers {
    pub out: String,
    pub err: String,
}

/// Handle given to func app handlers for writing captured output.
#[derive(Clone, Default)]
pub struct TaskContext {
    buffers: Arc<Mutex<OutputBuffers>>,
}

impl TaskContext {
    pub fn buffers(&self) -> Arc<Mutex<OutputBuffers>> {
        self.buffers.clone()
    }

    /// Append a line to the task's captured stdout.
    pub fn print(&self, line: &str) {
        let mut buffers = self.buffers.lock().unwrap();
        buffers.out.push_str(line);
        buffers.out.push('\n');
    }

    /// Append a line to the task's captured stderr.
    pub fn eprint(&self, line: &str) {
        let mut buffers = self.buffers.lock().unwrap();
        buffers.err.push_str(line);
        buffers.err.push('\n');
    }
}

/// In-process handler of a func app.
pub type FuncHandler = Arc<dyn Fn(&TaskContext, &TaskInput) -> Result<Value> + Send + Sync>;

/// One app known to this process.
#[derive(Clone)]
pub struct RegisteredApp {
    pub name: String,
    /// Normalized source text (func) or JSON command template (bash).
    pub source: String,
    pub version: String,
    pub kind: AppKind,
    pub app_hash: String,
    /// Present for func apps only.
    pub handler: Option<FuncHandler>,
}

/// Registry of apps a worker process can execute.
///
/// Workers look tasks up by app name and refuse rows whose `app_hash` does
/// not match the registered source: running silently changed code would
/// break identity-based reuse.
#[derive(Clone, Default)]
pub struct AppRegistry {
    apps: HashMap<String, RegisteredApp>,
}

impl AppRegistry {
    pub fn register(&mut self, app: RegisteredApp) {
        self.apps.insert(app.name.clone(), app);
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredApp> {
        self.apps.get(name)
    }

    /// Names of func apps this registry can execute, used to restrict claims.
    pub fn known_func_apps(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .apps
            .values()
            .filter(|app| app.kind == AppKind::Func)
            .map(|app| app.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

/// How a submission matches against prior rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ReusePolicy {
    /// Content identity: any change to source or arguments yields a new id.
    #[default]
    Fresh,
    /// Match by app name and arguments, ignoring source. Optionally only
    /// rows in a given prior state are reused.
    ByName {
        name: Option<String>,
        state: Option<TaskState>,
    },
    /// No-op: the future resolves immediately to null.
    Skip,
}

/// Configuration bundle used when submitting tasks.
#[derive(Clone)]
pub struct TaskManager {
    queue: Queue,
    config: TaskManagerConfig,
    tm_blob: Vec<u8>,
    tm_hash: String,
    registry: Arc<RwLock<AppRegistry>>,
}

impl TaskManager {
    pub fn new(queue: Queue, config: TaskManagerConfig) -> Result<Self> {
        config.validate()?;
        let tm_blob = config.to_blob()?;
        let tm_hash = config.digest()?;
        Ok(Self {
            queue,
            config,
            tm_blob,
            tm_hash,
            registry: Arc::new(RwLock::new(AppRegistry::default())),
        })
    }

    /// Independent manager with a different configuration, sharing the queue
    /// and the app registry.
    pub fn clone_with(&self, config: TaskManagerConfig) -> Result<Self> {
        config.validate()?;
        let tm_blob = config.to_blob()?;
        let tm_hash = config.digest()?;
        Ok(Self {
            queue: self.queue.clone(),
            config,
            tm_blob,
            tm_hash,
            registry: self.registry.clone(),
        })
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    pub fn tm_hash(&self) -> &str {
        &self.tm_hash
    }

    pub fn registry(&self) -> Arc<RwLock<AppRegistry>> {
        self.registry.clone()
    }

    /// Declare a func app: an in-process handler registered under an
    /// explicit (name, source, version) identity tuple.
    pub fn func_app(
        &self,
        name: &str,
        source: &str,
        version: &str,
        handler: FuncHandler,
    ) -> Result<App> {
        let source = hashing::normalize_source(source);
        let app_hash = hashing::app_hash(&source, version);
        self.registry.write().unwrap().register(RegisteredApp {
            name: name.to_string(),
            source: source.clone(),
            version: version.to_string(),
            kind: AppKind::Func,
            app_hash: app_hash.clone(),
            handler: Some(handler),
        });
        Ok(App {
            manager: self.clone(),
            name: name.to_string(),
            source,
            kind: AppKind::Func,
            app_hash,
            policy: ReusePolicy::Fresh,
        })
    }

    /// Declare a bash app from a command template.
    ///
    /// Template tokens may contain `{}`, `{0}` or `{name}` placeholders
    /// (with optional precision such as `{avg:.4f}`) substituted from the
    /// materialized arguments at execution time. The JSON-encoded template
    /// is the app source, so it persists with every task row and any worker
    /// can execute it.
    pub fn bash_app(&self, name: &str, template: &[&str], version: &str) -> Result<App> {
        let tokens: Vec<String> = template.iter().map(|token| token.to_string()).collect();
        let source = serde_json::to_string(&tokens)?;
        let app_hash = hashing::app_hash(&source, version);
        self.registry.write().unwrap().register(RegisteredApp {
            name: name.to_string(),
            source: source.clone(),
            version: version.to_string(),
            kind: AppKind::Bash,
            app_hash: app_hash.clone(),
            handler: None,
        });
        Ok(App {
            manager: self.clone(),
            name: name.to_string(),
            source,
            kind: AppKind::Bash,
            app_hash,
            policy: ReusePolicy::Fresh,
        })
    }
}

/// A declared app, ready to be invoked with concrete arguments.
///
/// Policy modifiers return a modified copy, so one declaration can be
/// submitted under different reuse policies.
#[derive(Clone)]
pub struct App {
    manager: TaskManager,
    name: String,
    source: String,
    kind: AppKind,
    app_hash: String,
    policy: ReusePolicy,
}

impl App {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn app_hash(&self) -> &str {
        &self.app_hash
    }

    /// Make submissions no-ops resolving to null.
    pub fn skip(mut self) -> Self {
        self.policy = ReusePolicy::Skip;
        self
    }

    /// Match prior rows by this app's name and arguments, ignoring source.
    pub fn reuse_by_name(mut self) -> Self {
        self.policy = match self.policy {
            ReusePolicy::ByName { state, .. } => ReusePolicy::ByName { name: None, state },
            _ => ReusePolicy::ByName {
                name: None,
                state: None,
            },
        };
        self
    }

    /// Match prior rows submitted under a different app name.
    pub fn reuse_as(mut self, name: &str) -> Self {
        self.policy = match self.policy {
            ReusePolicy::ByName { state, .. } => ReusePolicy::ByName {
                name: Some(name.to_string()),
                state,
            },
            _ => ReusePolicy::ByName {
                name: Some(name.to_string()),
                state: None,
            },
        };
        self
    }

    /// Only reuse a prior row in the given state; anything else inserts a
    /// fresh task. Implies name-based matching.
    pub fn reuse_state(mut self, state: TaskState) -> Self {
        self.policy = match self.policy {
            ReusePolicy::ByName { name, .. } => ReusePolicy::ByName {
                name,
                state: Some(state),
            },
            _ => ReusePolicy::ByName {
                name: None,
                state: Some(state),
            },
        };
        self
    }

    /// Submit with positional arguments.
    pub async fn submit(&self, args: Vec<Value>) -> Result<TaskFuture> {
        self.submit_with(args, BTreeMap::new()).await
    }

    /// Submit with positional and keyword arguments.
    ///
    /// Arguments referencing other tasks (see [`TaskFuture::as_value`]) are
    /// recorded as dependencies; the task starts WAITING until they all
    /// succeed. Returns a future for the matched or inserted task.
    pub async fn submit_with(
        &self,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<TaskFuture> {
        let args_blob = codec::encode_args(&args)?;
        let kwargs_blob = codec::encode_kwargs(&kwargs)?;

        let mut deps = BTreeSet::new();
        for value in args.iter().chain(kwargs.values()) {
            codec::collect_deps(value, &mut deps);
        }
        let deps: Vec<String> = deps.into_iter().collect();

        let queue = self.manager.queue.clone();

        match &self.policy {
            ReusePolicy::Skip => {
                let id = hashing::task_id(&self.name, &self.app_hash, &args_blob, &kwargs_blob);
                if !queue.task_exists(&id).await? {
                    let mut marker = self.build_task(id.clone(), args_blob, kwargs_blob, deps);
                    marker.state = TaskState::Succeeded;
                    marker.result = Some(codec::encode_result(&Value::Null)?);
                    marker.t_finished = Some(shared::utils::current_timestamp());
                    queue.insert_task(&marker).await?;
                }
                debug!("Skipped app '{}' as task {}", self.name, id);
                Ok(TaskFuture::new(id, queue))
            }
            ReusePolicy::ByName { name, state } => {
                let lookup = name.as_deref().unwrap_or(&self.name);
                if let Some(prior) = queue
                    .find_reusable(lookup, &args_blob, &kwargs_blob, *state)
                    .await?
                {
                    debug!(
                        "Reusing task {} for app '{}' by name '{}'",
                        prior.id, self.name, lookup
                    );
                    return Ok(TaskFuture::new(prior.id, queue));
                }
                self.insert_fresh(args_blob, kwargs_blob, deps).await
            }
            ReusePolicy::Fresh => {
                let id = hashing::task_id(&self.name, &self.app_hash, &args_blob, &kwargs_blob);
                if let Some(prior) = queue.task(&id).await? {
                    if !prior.state.is_failed() {
                        debug!("Reusing task {} ({}) for app '{}'", id, prior.state, self.name);
                        return Ok(TaskFuture::new(id, queue));
                    }
                    debug!(
                        "Prior task {} for app '{}' is {}, re-submitting",
                        id, self.name, prior.state
                    );
                }
                self.insert_fresh(args_blob, kwargs_blob, deps).await
            }
        }
    }

    async fn insert_fresh(
        &self,
        args_blob: Vec<u8>,
        kwargs_blob: Vec<u8>,
        deps: Vec<String>,
    ) -> Result<TaskFuture> {
        let id = hashing::task_id(&self.name, &self.app_hash, &args_blob, &kwargs_blob);
        let task = self.build_task(id.clone(), args_blob, kwargs_blob, deps);
        self.manager.queue.insert_task(&task).await?;
        debug!(
            "Submitted app '{}' as task {} ({})",
            self.name, id, task.state
        );
        Ok(TaskFuture::new(id, self.manager.queue.clone()))
    }

    fn build_task(
        &self,
        id: String,
        args_blob: Vec<u8>,
        kwargs_blob: Vec<u8>,
        deps: Vec<String>,
    ) -> Task {
        Task::new(
            id,
            self.name.clone(),
            self.app_hash.clone(),
            self.source.clone(),
            self.kind,
            args_blob,
            kwargs_blob,
            deps,
            self.manager.tm_blob.clone(),
            self.manager.tm_hash.clone(),
        )
    }
}
