//! Environment variable driven configuration
//!
//! All knobs are read from `AWS_EMF_` prefixed variables, e.g.
//! `AWS_EMF_LOG_GROUP_NAME` or `AWS_EMF_AGENT_ENDPOINT`. Service name
//! and type additionally fall back to the unprefixed `SERVICE_NAME` and
//! `SERVICE_TYPE` variables.
use crate::context::DEFAULT_NAMESPACE;
use serde::Deserialize;
use std::env::var;

/// Forces environment detection to a specific answer instead of probing
#[derive(Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
pub enum EnvironmentOverride {
    Local,
    Lambda,
    Agent,
    EC2,
    ECS,
}

#[derive(Deserialize, Debug, Default, PartialEq, Clone)]
pub struct Config {
    pub(crate) log_group_name: Option<String>,
    pub(crate) log_stream_name: Option<String>,
    pub(crate) enable_debug_logging: Option<bool>,
    pub(crate) service_name: Option<String>,
    pub(crate) service_type: Option<String>,
    pub(crate) agent_endpoint: Option<String>,
    pub(crate) namespace: Option<String>,
    pub(crate) environment: Option<EnvironmentOverride>,
}

impl Config {
    /// The namespace new contexts start with
    pub(crate) fn namespace(&self) -> String {
        self.namespace
            .clone()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.into())
    }

    pub(crate) fn service_name(&self) -> Option<String> {
        self.service_name
            .clone()
            .or_else(|| var("SERVICE_NAME").ok())
    }

    pub(crate) fn service_type(&self) -> Option<String> {
        self.service_type
            .clone()
            .or_else(|| var("SERVICE_TYPE").ok())
    }
}

pub(crate) fn get() -> Config {
    envy::prefixed("AWS_EMF_").from_env().unwrap_or_default()
}
