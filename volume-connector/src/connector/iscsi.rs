//! iSCSI connector (open-iscsi `iscsiadm`)
//!
//! A volume is one or more `(portal, iqn, lun)` paths. Connect creates the
//! node record, applies CHAP settings, logs in to every portal and waits for
//! the `/dev/disk/by-path` links udev creates for each LUN. Logout is
//! target-wide, so it only happens once no other LUN of the target remains
//! on the host.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{
    ConnectorContext, Transport, describe, extend_scsi_devices, present_devices, preferred_paths,
    remove_scsi_devices,
};
use crate::error::{ConnectorError, Result};
use crate::executor::{CommandSpec, ExecError};
use crate::properties::{ConnectionProperties, DeviceInfo, DisconnectOptions, DisconnectReport};
use crate::types::{Endpoint, Protocol, is_iscsi_name, parse_endpoints};

// iscsiadm exit codes
const ISCSI_ERR_TRANS: i32 = 4;
const ISCSI_ERR_TRANS_TIMEOUT: i32 = 8;
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

/// CHAP credentials for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapCredentials {
    pub method: String,
    pub username: String,
    pub password: String,
}

/// One portal/target/LUN path to the volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiPath {
    pub portal: Endpoint,
    pub iqn: String,
    pub lun: u32,
}

impl IscsiPath {
    /// udev link for this path.
    pub fn by_path(&self) -> PathBuf {
        PathBuf::from(format!(
            "/dev/disk/by-path/ip-{}-iscsi-{}-lun-{}",
            self.portal.to_portal_string(),
            self.iqn,
            self.lun
        ))
    }

    /// Glob over every LUN of this path's target.
    ///
    /// The portal and IQN are matched literally; an IPv6 portal carries
    /// brackets that glob would read as a character class.
    fn target_luns_pattern(&self) -> String {
        let prefix = format!(
            "/dev/disk/by-path/ip-{}-iscsi-{}",
            self.portal.to_portal_string(),
            self.iqn
        );
        format!("{}-lun-*", glob::Pattern::escape(&prefix))
    }
}

/// Validated iSCSI connection properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiTarget {
    pub paths: Vec<IscsiPath>,
    pub chap: Option<ChapCredentials>,
}

impl IscsiTarget {
    fn identifier(&self) -> String {
        let first = &self.paths[0];
        format!("{} lun {}", first.iqn, first.lun)
    }

    fn candidates(&self) -> Vec<PathBuf> {
        self.paths.iter().map(IscsiPath::by_path).collect()
    }

    /// Distinct `(portal, iqn)` sessions.
    fn sessions(&self) -> Vec<(Endpoint, String)> {
        let mut seen = BTreeSet::new();
        self.paths
            .iter()
            .filter(|p| seen.insert((p.portal.to_portal_string(), p.iqn.clone())))
            .map(|p| (p.portal.clone(), p.iqn.clone()))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawIscsiProperties {
    #[serde(default, alias = "portal")]
    target_portal: Option<String>,
    #[serde(default)]
    target_portals: Option<Vec<String>>,
    #[serde(default, alias = "iqn")]
    target_iqn: Option<String>,
    #[serde(default)]
    target_iqns: Option<Vec<String>>,
    #[serde(default, alias = "lun")]
    target_lun: Option<u32>,
    #[serde(default)]
    target_luns: Option<Vec<u32>>,
    #[serde(default)]
    auth_method: Option<String>,
    #[serde(default)]
    auth_username: Option<String>,
    #[serde(default)]
    auth_password: Option<String>,
}

/// Spread a singular value over `n` paths, or check a plural one has `n` entries.
fn spread<T: Clone>(
    plural: Option<Vec<T>>,
    singular: Option<T>,
    n: usize,
    name: &str,
) -> std::result::Result<Vec<T>, String> {
    match (plural, singular) {
        (Some(values), _) if values.len() == n => Ok(values),
        (Some(values), _) if values.len() == 1 => Ok(vec![values[0].clone(); n]),
        (Some(values), _) => Err(format!(
            "{} has {} entries but there are {} portals",
            name,
            values.len(),
            n
        )),
        (None, Some(value)) => Ok(vec![value; n]),
        (None, None) => Err(format!("missing {}", name)),
    }
}

impl RawIscsiProperties {
    fn validate(self) -> std::result::Result<IscsiTarget, String> {
        let portal_strings = match (self.target_portals, self.target_portal) {
            (Some(list), _) if !list.is_empty() => list,
            (_, Some(one)) => vec![one],
            _ => return Err("missing target_portal".to_string()),
        };
        let portals = parse_endpoints(&portal_strings, 3260).map_err(|e| e.to_string())?;

        let n = portals.len();
        let iqns = spread(self.target_iqns, self.target_iqn, n, "target_iqn")?;
        let luns = spread(self.target_luns, self.target_lun, n, "target_lun")?;
        if let Some(bad) = iqns.iter().find(|iqn| !is_iscsi_name(iqn)) {
            return Err(format!("'{}' is not an iSCSI qualified name", bad));
        }

        let chap = match self.auth_method {
            Some(method) if !method.eq_ignore_ascii_case("none") => {
                match (self.auth_username, self.auth_password) {
                    (Some(username), Some(password)) => Some(ChapCredentials {
                        method,
                        username,
                        password,
                    }),
                    _ => return Err("auth_method requires auth_username and auth_password".to_string()),
                }
            }
            _ => None,
        };

        let paths = portals
            .into_iter()
            .zip(iqns)
            .zip(luns)
            .map(|((portal, iqn), lun)| IscsiPath { portal, iqn, lun })
            .collect();
        Ok(IscsiTarget { paths, chap })
    }
}

fn is_transient_login_error(e: &ExecError) -> bool {
    matches!(e.exit_code(), Some(ISCSI_ERR_TRANS | ISCSI_ERR_TRANS_TIMEOUT))
}

/// iSCSI transport.
#[derive(Debug, Clone)]
pub struct IscsiConnector {
    ctx: ConnectorContext,
}

impl IscsiConnector {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx }
    }

    fn node(portal: &Endpoint, iqn: &str) -> CommandSpec {
        CommandSpec::new("iscsiadm").args([
            "-m",
            "node",
            "-T",
            iqn,
            "-p",
            &portal.to_portal_string(),
        ])
    }

    /// Create the node record unless it already exists.
    async fn ensure_node(&self, portal: &Endpoint, iqn: &str) -> Result<()> {
        let query = Self::node(portal, iqn).ok_codes(&[0, ISCSI_ERR_NO_OBJS_FOUND]);
        let out = self.ctx.run(query).await?;
        if out.exit_code == ISCSI_ERR_NO_OBJS_FOUND {
            debug!(iqn = %iqn, portal = %portal, "Creating iSCSI node record");
            self.ctx
                .run(Self::node(portal, iqn).args(["--op", "new"]))
                .await?;
        }
        Ok(())
    }

    async fn update_node(&self, portal: &Endpoint, iqn: &str, key: &str, value: &str) -> Result<()> {
        self.ctx
            .run(Self::node(portal, iqn).args(["--op", "update", "-n", key, "-v", value]))
            .await?;
        Ok(())
    }

    async fn login(&self, portal: &Endpoint, iqn: &str, chap: Option<&ChapCredentials>) -> Result<()> {
        self.ensure_node(portal, iqn).await?;
        if let Some(chap) = chap {
            self.update_node(portal, iqn, "node.session.auth.authmethod", &chap.method)
                .await?;
            self.update_node(portal, iqn, "node.session.auth.username", &chap.username)
                .await?;
            self.update_node(portal, iqn, "node.session.auth.password", &chap.password)
                .await?;
        }

        let cmd = Self::node(portal, iqn)
            .arg("--login")
            .ok_codes(&[0, ISCSI_ERR_SESS_EXISTS]);
        match self
            .ctx
            .run_retrying("iscsi_login", cmd, is_transient_login_error)
            .await
        {
            Ok(_) => {
                info!(iqn = %iqn, portal = %portal, "iSCSI login successful");
                Ok(())
            }
            Err(ConnectorError::Command(e))
                if e.mentions("already present") || e.mentions("session already exists") =>
            {
                info!(iqn = %iqn, portal = %portal, "iSCSI session already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn logout(&self, portal: &Endpoint, iqn: &str) -> Result<()> {
        let cmd = Self::node(portal, iqn)
            .arg("--logout")
            .ok_codes(&[0, ISCSI_ERR_NO_OBJS_FOUND]);
        match self.ctx.run(cmd).await {
            Ok(_) => {}
            Err(ConnectorError::Command(e))
                if e.mentions("No matching sessions") || e.mentions("not logged in") =>
            {
                debug!(iqn = %iqn, portal = %portal, "iSCSI target was not logged in");
            }
            Err(e) => return Err(e),
        }
        self.ctx
            .run(
                Self::node(portal, iqn)
                    .args(["--op", "delete"])
                    .ok_codes(&[0, ISCSI_ERR_NO_OBJS_FOUND]),
            )
            .await?;
        info!(iqn = %iqn, portal = %portal, "iSCSI logout complete");
        Ok(())
    }

    /// Canonical devices of our LUNs currently on the host.
    fn attached_devices(&self, target: &IscsiTarget) -> Vec<PathBuf> {
        let scanner = &self.ctx.scanner;
        scanner.resolve(&scanner.present(&target.candidates()))
    }

    /// Whether another LUN of the same session is still attached.
    fn session_in_use(&self, target: &IscsiTarget, portal: &Endpoint, iqn: &str) -> bool {
        let ours: BTreeSet<PathBuf> = target.candidates().into_iter().collect();
        target
            .paths
            .iter()
            .filter(|p| &p.portal == portal && p.iqn == iqn)
            .take(1)
            .flat_map(|p| self.ctx.host.glob(&p.target_luns_pattern()))
            .any(|link| !ours.contains(&link))
    }
}

#[async_trait]
impl Transport for IscsiConnector {
    type Target = IscsiTarget;

    fn protocol(&self) -> Protocol {
        Protocol::Iscsi
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    fn parse(&self, props: &ConnectionProperties) -> Result<IscsiTarget> {
        props
            .parse::<RawIscsiProperties>(Protocol::Iscsi)?
            .validate()
            .map_err(|reason| ConnectorError::invalid(Protocol::Iscsi, reason))
    }

    fn lock_key(&self, target: &IscsiTarget) -> String {
        let iqns: BTreeSet<&str> = target.paths.iter().map(|p| p.iqn.as_str()).collect();
        format!("iscsi:{}", iqns.into_iter().collect::<Vec<_>>().join(","))
    }

    async fn connect(&self, target: &IscsiTarget, props: &ConnectionProperties) -> Result<DeviceInfo> {
        let sessions = target.sessions();
        let mut logged_in = 0;
        let mut last_error = None;

        for (portal, iqn) in &sessions {
            match self.login(portal, iqn, target.chap.as_ref()).await {
                Ok(()) => logged_in += 1,
                Err(e) if sessions.len() > 1 => {
                    warn!(portal = %portal, error = %e, "iSCSI login failed for portal (continuing with other portals)");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        if logged_in == 0
            && let Some(e) = last_error
        {
            return Err(e);
        }

        let candidates = target.candidates();
        let wanted = self.ctx.paths_wanted(Protocol::Iscsi, props, candidates.len());
        let found = self
            .ctx
            .scanner
            .wait_for_paths(&target.identifier(), &candidates, wanted)
            .await?;
        let devices = self.ctx.scanner.resolve(&found);
        describe(&self.ctx, Protocol::Iscsi, props, &devices).await
    }

    async fn disconnect(
        &self,
        target: &IscsiTarget,
        device_info: Option<&DeviceInfo>,
        options: &DisconnectOptions,
    ) -> Result<DisconnectReport> {
        let mut devices = self.attached_devices(target);
        if let Some(info) = device_info {
            for path in info.paths.iter().filter(|p| self.ctx.host.exists(p)) {
                if !devices.contains(path) {
                    devices.push(path.clone());
                }
            }
        }

        let (removed, remaining, mut warnings) =
            remove_scsi_devices(&self.ctx, &devices, options).await?;
        if !remaining.is_empty() {
            warn!(remaining = ?remaining, "Devices still present, keeping iSCSI sessions");
            return DisconnectReport::conclude(removed, remaining, warnings, options);
        }

        for (portal, iqn) in target.sessions() {
            if self.session_in_use(target, &portal, &iqn) {
                info!(iqn = %iqn, portal = %portal, "Other LUNs still attached, not logging out");
                continue;
            }
            if let Err(e) = self.logout(&portal, &iqn).await {
                if !options.ignore_errors && !options.force {
                    return Err(e);
                }
                warnings.push(format!("logout from {} at {} failed: {}", iqn, portal, e));
            }
        }

        DisconnectReport::conclude(removed, remaining, warnings, options)
    }

    async fn extend_volume(&self, target: &IscsiTarget) -> Result<u64> {
        let devices = present_devices(&self.ctx, &target.identifier(), &target.candidates())?;
        extend_scsi_devices(&self.ctx, &devices).await
    }

    async fn get_volume_paths(
        &self,
        target: &IscsiTarget,
        props: &ConnectionProperties,
    ) -> Result<Vec<PathBuf>> {
        let devices = self.attached_devices(target);
        Ok(preferred_paths(&self.ctx, Protocol::Iscsi, props, devices).await)
    }
}
