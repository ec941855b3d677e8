use crate::models::{AgentCapabilities, AgentConfig, AgentEnvironment};
use std::time::Duration;

/// Named, immutable blueprint from which concrete agents are instantiated.
///
/// Templates carry everything needed to respawn an agent after a crash:
/// the startup command, environment defaults, and health expectations.
#[derive(Debug, Clone)]
pub struct AgentTemplate {
    pub name: String,
    pub agent_type: String,
    pub capabilities: AgentCapabilities,
    pub config: AgentConfig,
    pub environment: AgentEnvironment,
    pub startup_program: String,
    pub startup_args: Vec<String>,
    pub heartbeat_interval: Duration,
    pub startup_timeout: Duration,
    pub auto_restart: bool,
}

impl AgentTemplate {
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        startup_program: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities: AgentCapabilities::default(),
            config: AgentConfig::default(),
            environment: AgentEnvironment::default(),
            startup_program: startup_program.into(),
            startup_args: Vec::new(),
            heartbeat_interval: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(30),
            auto_restart: true,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.startup_args = args;
        self
    }

    pub fn with_capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = auto_restart;
        self
    }
}

fn capability_bag(domains: &[&str], tools: &[&str]) -> AgentCapabilities {
    AgentCapabilities {
        domains: domains.iter().map(|s| s.to_string()).collect(),
        tools: tools.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// The pre-registered template set. Callers may register more; these cover
/// the common worker roles.
pub fn default_templates() -> Vec<AgentTemplate> {
    vec![
        AgentTemplate::new("researcher", "researcher", "strand-agent")
            .with_args(vec!["--role".to_string(), "researcher".to_string()])
            .with_capabilities(capability_bag(
                &["research", "analysis", "documentation"],
                &["web-search", "document-reader"],
            )),
        AgentTemplate::new("coder", "coder", "strand-agent")
            .with_args(vec!["--role".to_string(), "coder".to_string()])
            .with_capabilities(capability_bag(
                &["implementation", "refactoring"],
                &["editor", "shell", "git"],
            )),
        AgentTemplate::new("analyst", "analyst", "strand-agent")
            .with_args(vec!["--role".to_string(), "analyst".to_string()])
            .with_capabilities(capability_bag(
                &["analysis", "data", "reporting"],
                &["query-engine", "spreadsheet"],
            )),
        AgentTemplate::new("tester", "tester", "strand-agent")
            .with_args(vec!["--role".to_string(), "tester".to_string()])
            .with_capabilities(capability_bag(
                &["testing", "verification"],
                &["shell", "test-runner"],
            )),
        AgentTemplate::new("coordinator", "coordinator", "strand-agent")
            .with_args(vec!["--role".to_string(), "coordinator".to_string()])
            .with_capabilities(capability_bag(
                &["coordination", "planning"],
                &["scheduler"],
            )),
    ]
}
