//! Runtime environment detection
//!
//! Each environment knows how to probe for itself, which identity
//! defaults it contributes, which properties it stamps onto a context
//! before serialization, and which sink its metrics should flow to.
use crate::{
    config::{Config, EnvironmentOverride},
    context::MetricsContext,
    serialize::LogSerializer,
    sink::{Agent, Console, Sink},
};
use hyper::Uri;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::{
    borrow::Cow,
    collections::BTreeMap,
    env::var,
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    time::Duration,
};
use tracing::{debug, warn};

const DEFAULT_AGENT_PORT: u16 = 25888;

pub(crate) trait Environment {
    fn probe(&mut self) -> bool;
    fn name(&self) -> Cow<'_, str>;
    fn env_type(&self) -> Cow<'_, str>;
    fn log_group_name(&self) -> Cow<'_, str>;
    fn configure(
        &self,
        context: &mut MetricsContext,
    );
    fn sink(&self) -> Box<dyn Sink>;
}

pub(crate) struct Detector;

impl Detector {
    /// Resolve the runtime environment, honoring an explicit override
    /// before probing Lambda, then ECS, then EC2, and falling back to
    /// the agent-backed default
    pub(crate) fn detect(config: &Config) -> Box<dyn Environment> {
        if let Some(overridden) = Self::overridden(config) {
            return overridden;
        }
        let potentials: Vec<Box<dyn Environment>> = vec![
            Box::new(Lambda),
            Box::new(Ecs::new(config.clone())),
            Box::new(Ec2::new(config.clone())),
        ];
        for mut env in potentials.into_iter() {
            if env.probe() {
                debug!("detected environment {}", env.env_type());
                return env;
            }
        }
        Box::new(DefaultEnvironment(config.clone()))
    }

    fn overridden(config: &Config) -> Option<Box<dyn Environment>> {
        let environment: Box<dyn Environment> = match config.environment? {
            EnvironmentOverride::Lambda => Box::new(Lambda),
            EnvironmentOverride::ECS => Box::new(Ecs::new(config.clone())),
            EnvironmentOverride::EC2 => Box::new(Ec2::new(config.clone())),
            EnvironmentOverride::Agent => Box::new(DefaultEnvironment(config.clone())),
            EnvironmentOverride::Local => Box::new(Local(config.clone())),
        };
        debug!("environment detection overridden by configuration");
        Some(environment)
    }
}

enum FetchError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Uri(hyper::http::uri::InvalidUri),
}

impl std::fmt::Display for FetchError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            FetchError::Io(err) => write!(f, "{}", err),
            FetchError::Parse(err) => write!(f, "{}", err),
            FetchError::Uri(err) => write!(f, "{}", err),
        }
    }
}

/// Minimal http/1.1 json fetch against link-local metadata services.
/// Short timeouts keep a non-AWS host from stalling detection.
fn fetch_json<T: DeserializeOwned>(
    host: &str,
    port: u16,
    path: &str,
) -> Result<T, FetchError> {
    let address = (host, port)
        .to_socket_addrs()
        .map_err(FetchError::Io)?
        .next()
        .ok_or_else(|| {
            FetchError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no address for host",
            ))
        })?;
    let mut conn = TcpStream::connect_timeout(&address, Duration::from_millis(50))
        .map_err(FetchError::Io)?;
    conn.set_read_timeout(Some(Duration::from_millis(50)))
        .map_err(FetchError::Io)?;

    conn.write_all(
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, host
        )
        .as_bytes(),
    )
    .map_err(FetchError::Io)?;

    let mut response = String::new();
    conn.read_to_string(&mut response).map_err(FetchError::Io)?;
    // the body follows the first blank line of the response
    let body = response.split("\r\n\r\n").nth(1).unwrap_or_default();
    serde_json::from_str(body).map_err(FetchError::Parse)
}

/// The fallback when nothing more specific probes true: identity from
/// configuration, metrics to the agent
pub(crate) struct DefaultEnvironment(Config);

impl Environment for DefaultEnvironment {
    fn probe(&mut self) -> bool {
        true
    }

    fn name(&self) -> Cow<'_, str> {
        self.0
            .service_name()
            .map(Cow::Owned)
            .unwrap_or_else(|| "Unknown".into())
    }

    fn env_type(&self) -> Cow<'_, str> {
        self.0
            .service_type()
            .map(Cow::Owned)
            .unwrap_or_else(|| "Unknown".into())
    }

    fn log_group_name(&self) -> Cow<'_, str> {
        match &self.0.log_group_name {
            // an explicitly empty log group is honored as "omit"
            Some(name) => name.clone().into(),
            None => format!("{}-metrics", self.name()).into(),
        }
    }

    fn configure(
        &self,
        _: &mut MetricsContext,
    ) {
    }

    fn sink(&self) -> Box<dyn Sink> {
        agent_or_console(
            self.log_group_name().into_owned(),
            self.0.log_stream_name.clone(),
            self.0.agent_endpoint.clone(),
        )
    }
}

/// Local development: no agent, events go to stdout
pub(crate) struct Local(Config);

impl Environment for Local {
    fn probe(&mut self) -> bool {
        true
    }

    fn name(&self) -> Cow<'_, str> {
        self.0
            .service_name()
            .map(Cow::Owned)
            .unwrap_or_else(|| "Unknown".into())
    }

    fn env_type(&self) -> Cow<'_, str> {
        "Local".into()
    }

    fn log_group_name(&self) -> Cow<'_, str> {
        "".into()
    }

    fn configure(
        &self,
        _: &mut MetricsContext,
    ) {
    }

    fn sink(&self) -> Box<dyn Sink> {
        Box::new(Console::default())
    }
}

pub(crate) struct Lambda;

impl Environment for Lambda {
    fn probe(&mut self) -> bool {
        var("AWS_LAMBDA_FUNCTION_NAME").is_ok()
    }

    fn name(&self) -> Cow<'_, str> {
        var("AWS_LAMBDA_FUNCTION_NAME")
            .unwrap_or_else(|_| "Unknown".into())
            .into()
    }

    fn env_type(&self) -> Cow<'_, str> {
        "AWS::Lambda::Function".into()
    }

    fn log_group_name(&self) -> Cow<'_, str> {
        self.name()
    }

    fn configure(
        &self,
        context: &mut MetricsContext,
    ) {
        if let Ok(value) = var("AWS_EXECUTION_ENV") {
            context.set_property("executionEnvironment", value);
        }
        if let Ok(value) = var("AWS_LAMBDA_FUNCTION_MEMORY_SIZE") {
            context.set_property("memorySize", value);
        }
        if let Ok(value) = var("AWS_LAMBDA_FUNCTION_VERSION") {
            context.set_property("functionVersion", value);
        }
        if let Ok(value) = var("AWS_LAMBDA_LOG_STREAM_NAME") {
            context.set_property("logStreamId", value);
        }
        // only traces that were sampled are worth pointing at
        if let Ok(value) = var("_X_AMZN_TRACE_ID") {
            if value.contains("Sampled=1") {
                context.set_property("traceId", value);
            }
        }
    }

    fn sink(&self) -> Box<dyn Sink> {
        Box::new(Console::default())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EcsMetadataResponse {
    image: Option<String>,
    created_at: Option<String>,
    started_at: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

pub(crate) struct Ecs {
    config: Config,
    metadata: Option<EcsMetadataResponse>,
    fluent_bit_endpoint: Option<String>,
}

impl Ecs {
    fn new(config: Config) -> Self {
        Self {
            config,
            metadata: None,
            fluent_bit_endpoint: None,
        }
    }

    fn fetch(uri: &str) -> Result<EcsMetadataResponse, FetchError> {
        let parsed = uri.parse::<Uri>().map_err(FetchError::Uri)?;
        let host = parsed.host().ok_or_else(|| {
            FetchError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "metadata uri has no host",
            ))
        })?;
        let port = parsed.port().map(|p| p.as_u16()).unwrap_or(80);
        fetch_json(host, port, parsed.path())
    }
}

impl Environment for Ecs {
    fn probe(&mut self) -> bool {
        let metadata_uri = match var("ECS_CONTAINER_METADATA_URI") {
            Ok(uri) => uri,
            Err(_) => return false,
        };

        // under firelens the log group lives in the fluent-bit config,
        // and metrics flow to the fluent host instead of a local agent
        if let Ok(fluent_host) = var("FLUENT_HOST") {
            if self.config.agent_endpoint.is_none() {
                self.fluent_bit_endpoint =
                    Some(format!("tcp://{}:{}", fluent_host, DEFAULT_AGENT_PORT));
            }
        }

        match Self::fetch(&metadata_uri) {
            Ok(metadata) => self.metadata = Some(metadata),
            Err(err) => warn!("failed to collect ecs container metadata: {}", err),
        }

        // the metadata endpoint existing at all settles the question
        true
    }

    fn name(&self) -> Cow<'_, str> {
        if let Some(name) = self.config.service_name() {
            return name.into();
        }
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.image.as_deref())
            // strip any registry prefix: .../my-image:latest -> my-image:latest
            .map(|image| image.rsplit('/').next().unwrap_or(image).into())
            .unwrap_or_else(|| "Unknown".into())
    }

    fn env_type(&self) -> Cow<'_, str> {
        "AWS::ECS::Container".into()
    }

    fn log_group_name(&self) -> Cow<'_, str> {
        if self.fluent_bit_endpoint.is_some() {
            return "".into();
        }
        match &self.config.log_group_name {
            Some(name) => name.clone().into(),
            None => self.name(),
        }
    }

    fn configure(
        &self,
        context: &mut MetricsContext,
    ) {
        if let Ok(hostname) = var("HOSTNAME") {
            context.set_property("containerId", hostname);
        }
        if let Some(metadata) = &self.metadata {
            if let Some(created_at) = &metadata.created_at {
                context.set_property("createdAt", created_at.as_str());
            }
            if let Some(started_at) = &metadata.started_at {
                context.set_property("startedAt", started_at.as_str());
            }
            if let Some(image) = &metadata.image {
                context.set_property("image", image.as_str());
            }
            if let Some(cluster) = metadata.labels.get("com.amazonaws.ecs.cluster") {
                context.set_property("cluster", cluster.as_str());
            }
            if let Some(task_arn) = metadata.labels.get("com.amazonaws.ecs.task-arn") {
                context.set_property("taskArn", task_arn.as_str());
            }
        }
    }

    fn sink(&self) -> Box<dyn Sink> {
        agent_or_console(
            self.log_group_name().into_owned(),
            self.config.log_stream_name.clone(),
            self.fluent_bit_endpoint
                .clone()
                .or_else(|| self.config.agent_endpoint.clone()),
        )
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ec2MetadataResponse {
    image_id: String,
    availability_zone: String,
    private_ip: String,
    instance_id: String,
    instance_type: String,
}

pub(crate) struct Ec2 {
    config: Config,
    metadata: Option<Ec2MetadataResponse>,
}

impl Ec2 {
    fn new(config: Config) -> Self {
        Self {
            config,
            metadata: None,
        }
    }

    /// fetch ec2 instance metadata from the well known http endpoint
    /// https://docs.aws.amazon.com/AWSEC2/latest/UserGuide/instancedata-data-retrieval.html
    fn fetch() -> Result<Ec2MetadataResponse, FetchError> {
        fetch_json(
            "169.254.169.254",
            80,
            "/latest/dynamic/instance-identity/document",
        )
    }
}

impl Environment for Ec2 {
    fn probe(&mut self) -> bool {
        if self.metadata.is_some() {
            return true;
        }
        match Self::fetch() {
            Ok(metadata) => {
                self.metadata = Some(metadata);
                true
            }
            Err(err) => {
                debug!("no ec2 instance metadata available: {}", err);
                false
            }
        }
    }

    fn name(&self) -> Cow<'_, str> {
        self.config
            .service_name()
            .map(Cow::Owned)
            .unwrap_or_else(|| "Unknown".into())
    }

    fn env_type(&self) -> Cow<'_, str> {
        if self.metadata.is_some() {
            "AWS::EC2::Instance".into()
        } else {
            "Unknown".into()
        }
    }

    fn log_group_name(&self) -> Cow<'_, str> {
        match &self.config.log_group_name {
            Some(name) => name.clone().into(),
            None => format!("{}-metrics", self.name()).into(),
        }
    }

    fn configure(
        &self,
        context: &mut MetricsContext,
    ) {
        if let Some(metadata) = &self.metadata {
            context.set_property("imageId", metadata.image_id.as_str());
            context.set_property("instanceId", metadata.instance_id.as_str());
            context.set_property("instanceType", metadata.instance_type.as_str());
            context.set_property("privateIP", metadata.private_ip.as_str());
            context.set_property("availabilityZone", metadata.availability_zone.as_str());
        }
    }

    fn sink(&self) -> Box<dyn Sink> {
        agent_or_console(
            self.log_group_name().into_owned(),
            self.config.log_stream_name.clone(),
            self.config.agent_endpoint.clone(),
        )
    }
}

/// Agent sink creation can fail when no agent is listening; metrics then
/// fall through to stdout rather than being dropped
fn agent_or_console(
    log_group_name: String,
    log_stream_name: Option<String>,
    endpoint: Option<String>,
) -> Box<dyn Sink> {
    match Agent::create(log_group_name, log_stream_name, endpoint, LogSerializer) {
        Ok(agent) => Box::new(agent),
        Err(err) => {
            warn!("failed to connect to the metrics agent, writing to stdout: {}", err);
            Box::new(Console::default())
        }
    }
}
