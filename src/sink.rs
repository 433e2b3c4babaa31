//! Sinks contains interfaces and implementations for reporting metric
//! data to an external system
//!
//! Transport failures are logged and dropped here. Retry and timeout
//! policy is the receiving agent's concern, not the serializer's.
use crate::{
    context::MetricsContext,
    serialize::{LogSerializer, Serialize},
};
use hyper::Uri;
use std::{
    convert::{TryFrom, TryInto},
    error::Error as StdError,
    io::{self, Write},
    net::{TcpStream, UdpSocket},
    time::Duration,
};
use tracing::warn;

pub trait Sink {
    fn accept(
        &mut self,
        context: MetricsContext,
    );
}

/// Writes each serialized event to stdout, where log-based collection
/// picks it up. The preferred sink inside Lambda.
pub(crate) struct Console {
    serializer: Box<dyn Serialize>,
}

impl Default for Console {
    fn default() -> Console {
        Console {
            serializer: Box::new(LogSerializer),
        }
    }
}

impl Sink for Console {
    fn accept(
        &mut self,
        context: MetricsContext,
    ) {
        for event in self.serializer.serialize(&context) {
            println!("{}", event);
        }
    }
}

/// Ships serialized events to the CloudWatch agent over TCP or UDP
pub(crate) struct Agent {
    log_group_name: String,
    log_stream_name: Option<String>,
    transport: Transport,
    serializer: Box<dyn Serialize>,
}

enum Transport {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Transport {
    fn send(
        &mut self,
        bytes: &[u8],
    ) {
        let result = match self {
            Transport::Udp(socket) => socket.send(bytes).map(drop),
            Transport::Tcp(stream) => stream.write_all(bytes),
        };
        if let Err(err) = result {
            warn!("failed to write metrics to agent: {}", err);
        }
    }
}

impl TryFrom<Endpoint> for Transport {
    type Error = io::Error;
    fn try_from(ep: Endpoint) -> Result<Transport, Self::Error> {
        match ep {
            Endpoint::Tcp(host, port) => {
                let tcp = TcpStream::connect((host.as_str(), port))?;
                tcp.set_nonblocking(true)?;
                tcp.set_write_timeout(Some(Duration::from_secs(1)))?;
                Ok(Transport::Tcp(tcp))
            }
            Endpoint::Udp(host, port) => {
                let udp = UdpSocket::bind("0.0.0.0:0")?;
                udp.connect((host.as_str(), port))?;
                udp.set_nonblocking(true)?;
                udp.set_write_timeout(Some(Duration::from_secs(1)))?;
                Ok(Transport::Udp(udp))
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum Endpoint {
    Tcp(String, u16),
    Udp(String, u16),
}

impl Agent {
    fn parse(endpoint: impl AsRef<str>) -> Option<Endpoint> {
        let uri = endpoint.as_ref().parse::<Uri>().ok()?;
        let (host, port) = (uri.host()?, uri.port()?.as_u16());
        match uri.scheme_str()? {
            "tcp" => Some(Endpoint::Tcp(host.into(), port)),
            "udp" => Some(Endpoint::Udp(host.into(), port)),
            _ => None,
        }
    }

    pub(crate) fn create(
        log_group_name: String,
        log_stream_name: Option<String>,
        config_endpoint: Option<String>,
        serializer: impl Serialize + 'static,
    ) -> Result<Self, Box<dyn StdError>> {
        let transport = config_endpoint
            .and_then(|endpoint| {
                let parsed = Self::parse(&endpoint);
                if parsed.is_none() {
                    warn!("failed to parse agent endpoint {}, using default", endpoint);
                }
                parsed
            })
            .unwrap_or_else(|| Endpoint::Tcp("0.0.0.0".into(), 25888))
            .try_into()?;
        Ok(Self {
            log_group_name,
            log_stream_name,
            transport,
            serializer: Box::new(serializer),
        })
    }
}

impl Sink for Agent {
    fn accept(
        &mut self,
        context: MetricsContext,
    ) {
        let mut editable = context;
        // an empty log group means the receiver configures it elsewhere
        // (fluent-bit), so it is omitted from the envelope
        if !self.log_group_name.is_empty() {
            editable
                .meta
                .insert("LogGroupName".into(), self.log_group_name.as_str().into());
        }
        if let Some(stream) = &self.log_stream_name {
            editable
                .meta
                .insert("LogStreamName".into(), stream.as_str().into());
        }

        for payload in self.serializer.serialize(&editable) {
            let mut bytes = payload.into_bytes();
            bytes.push(b'\n');
            self.transport.send(&bytes);
        }
    }
}
