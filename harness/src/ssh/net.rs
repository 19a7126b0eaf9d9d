use super::Ssh;
use crate::{
    grudge::Grudge,
    identity::{Cluster, Node},
    nemesis::{Clocks, Net},
    Error,
};
use futures::future::try_join_all;

/// Flush every rule added by the harness.
const FLUSH: &str = "iptables -F -w && iptables -X -w";

/// Resynchronize the clock against NTP.
const RESYNC: &str = "ntpdate -b pool.ntp.org";

/// Command dropping inbound traffic from every node in `dropped`.
pub fn drop_command<'a>(dropped: impl IntoIterator<Item = &'a Node>) -> String {
    let mut command = FLUSH.to_string();
    for node in dropped {
        command.push_str(&format!(" && iptables -A INPUT -s {node} -j DROP -w"));
    }
    command
}

/// Command shifting the local clock by `offset_ms` milliseconds.
pub fn bump_command(offset_ms: i64) -> String {
    format!(
        "date -s \"@$(date +%s.%N | awk '{{printf \"%.3f\", $1 + ({offset_ms}) / 1000}}')\""
    )
}

/// Applies grudges with `iptables`.
#[derive(Clone, Debug)]
pub struct SshNet {
    ssh: Ssh,
    cluster: Cluster,
}

impl SshNet {
    pub fn new(ssh: Ssh, cluster: Cluster) -> Self {
        Self { ssh, cluster }
    }
}

impl Net for SshNet {
    async fn partition(&self, grudge: &Grudge) -> Result<(), Error> {
        try_join_all(grudge.iter().map(|(node, dropped)| {
            let command = drop_command(dropped);
            async move { self.ssh.execute(node.as_str(), &command).await }
        }))
        .await?;
        Ok(())
    }

    async fn heal(&self) -> Result<(), Error> {
        try_join_all(
            self.cluster
                .iter()
                .map(|node| self.ssh.execute(node.as_str(), FLUSH)),
        )
        .await?;
        Ok(())
    }
}

/// Adjusts clocks with `date`.
#[derive(Clone, Debug)]
pub struct SshClocks {
    ssh: Ssh,
}

impl SshClocks {
    pub fn new(ssh: Ssh) -> Self {
        Self { ssh }
    }
}

impl Clocks for SshClocks {
    async fn bump(&self, node: &Node, offset_ms: i64) -> Result<(), Error> {
        self.ssh.execute(node.as_str(), &bump_command(offset_ms)).await
    }

    async fn reset(&self, node: &Node) -> Result<(), Error> {
        self.ssh.execute(node.as_str(), RESYNC).await
    }
}
