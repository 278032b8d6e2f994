//! The invocation message a dispatcher binds and executes against.

/// One function invocation, as delivered by the surrounding dispatcher.
///
/// `funcptr > 0` selects a table-indexed entry point instead of the main
/// entry function; the `parallel_*` fields carry fork-join state for worker
/// invocations relayed from another host.
#[derive(Debug, Clone, Default)]
pub struct InvocationMessage {
    pub user: String,
    pub function: String,

    pub funcptr: i32,
    pub inputdata: String,

    /// Guest return code, recorded by `execute`.
    pub returnvalue: i32,

    /// Function is Python-backed and needs its source synced before running.
    pub is_python: bool,

    pub parallel_depth: i32,
    pub parallel_effective_depth: i32,
    pub parallel_max_active_levels: i32,
    pub parallel_num_threads: i32,
    pub parallel_thread_num: i32,
    pub parallel_function_args: Vec<i32>,
}

impl InvocationMessage {
    pub fn new(user: &str, function: &str) -> Self {
        InvocationMessage {
            user: user.to_string(),
            function: function.to_string(),
            ..Default::default()
        }
    }

    /// `user/function` label used in logs and compartment names.
    pub fn label(&self) -> String {
        format!("{}/{}", self.user, self.function)
    }
}

/// Environment variables made visible to the guest.
#[derive(Debug, Clone, Default)]
pub struct WasmEnvironment {
    vars: Vec<String>,
}

impl WasmEnvironment {
    pub fn set_var(&mut self, key: &str, value: &str) {
        self.vars.push(format!("{}={}", key, value));
    }

    pub fn vars(&self) -> &[String] {
        &self.vars
    }
}
