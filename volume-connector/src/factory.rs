//! Protocol name to connector lookup
//!
//! The table is static: adding a protocol means adding a [`Protocol`]
//! variant, a [`Connector`] variant and one row here.

use std::sync::Arc;

use tracing::debug;

use crate::config::ConnectorConfig;
use crate::connector::{
    Connector, ConnectorContext, DrbdConnector, FibreChannelConnector, IscsiConnector,
    LocalConnector, NvmeofConnector, RbdConnector,
};
use crate::error::{ConnectorError, Result};
use crate::executor::Executor;
use crate::host::HostIo;
use crate::properties::ConnectionProperties;
use crate::types::Protocol;

type Constructor = fn(ConnectorContext) -> Connector;

static CONNECTORS: &[(Protocol, Constructor)] = &[
    (Protocol::Iscsi, |ctx| Connector::Iscsi(IscsiConnector::new(ctx))),
    (Protocol::FibreChannel, |ctx| {
        Connector::FibreChannel(FibreChannelConnector::new(ctx, Protocol::FibreChannel))
    }),
    (Protocol::Fcoe, |ctx| {
        Connector::FibreChannel(FibreChannelConnector::new(ctx, Protocol::Fcoe))
    }),
    (Protocol::Nvmeof, |ctx| Connector::Nvmeof(NvmeofConnector::new(ctx))),
    (Protocol::Rbd, |ctx| Connector::Rbd(RbdConnector::new(ctx))),
    (Protocol::Local, |ctx| Connector::Local(LocalConnector::new(ctx))),
    (Protocol::Drbd, |ctx| Connector::Drbd(DrbdConnector::new(ctx))),
];

/// Builds connectors sharing one executor, host and configuration.
#[derive(Debug, Clone)]
pub struct ConnectorFactory {
    ctx: ConnectorContext,
}

impl ConnectorFactory {
    pub fn new(exec: Arc<dyn Executor>, host: Arc<dyn HostIo>, config: ConnectorConfig) -> Self {
        Self {
            ctx: ConnectorContext::new(exec, host, Arc::new(config)),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    /// Connector for a protocol name or alias (`fc`, `nvme`, `ceph`, ...).
    pub fn create(&self, protocol: &str) -> Result<Connector> {
        let protocol: Protocol = protocol
            .parse()
            .map_err(|e: crate::types::ProtocolParseError| ConnectorError::UnsupportedProtocol(e.0))?;
        self.create_for_protocol(protocol)
    }

    pub fn create_for_protocol(&self, protocol: Protocol) -> Result<Connector> {
        let (_, constructor) = CONNECTORS
            .iter()
            .find(|(p, _)| *p == protocol)
            .ok_or_else(|| ConnectorError::UnsupportedProtocol(protocol.to_string()))?;
        debug!(protocol = %protocol, "Creating connector");
        Ok(constructor(self.ctx.clone()))
    }

    /// Connector for the `protocol` field of `props`.
    pub fn create_for_properties(&self, props: &ConnectionProperties) -> Result<Connector> {
        match props.protocol()? {
            Some(protocol) => self.create_for_protocol(protocol),
            None => Err(ConnectorError::invalid("properties", "missing protocol")),
        }
    }

    /// Canonical names of every supported protocol.
    pub fn supported_protocols() -> Vec<&'static str> {
        CONNECTORS.iter().map(|(p, _)| p.as_str()).collect()
    }
}
