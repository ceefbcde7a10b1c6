//! nftables packet-filter adapter
//!
//! Translates a [`ForwardRule`] into the two NAT directives forwarding needs
//! and applies them through `nft --json`:
//!
//! 1. **DNAT** in the `prerouting` chain: `<proto> dport <external>` is
//!    rewritten to `<destination>:<destination port>`.
//! 2. **MASQUERADE** in the `postrouting` chain: traffic to
//!    `<destination>:<destination port>` leaves with this host's address so
//!    replies come back through it.
//!
//! All directives live in one table owned by natfwd (`ip natfwd` by
//! default). Flushing only ever touches that table; chains installed by other
//! tools are left alone. Each directive carries [`ForwardRule::tag`] as its
//! comment, which is how [`PacketFilter::remove`] finds it again.
//!
//! The [`PacketFilter`] trait is the seam the reconciliation engine and
//! [`crate::core::forwarder::PortForwarder`] are written against, so both can
//! be driven by an in-memory filter in tests.

use crate::core::error::{Directive, Error, Result};
use crate::core::forward::ForwardRule;
use serde_json::{Value, json};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, error, info};

pub const PREROUTING: &str = "prerouting";
pub const POSTROUTING: &str = "postrouting";

/// Capability to install and remove forwarding directives on the live system
///
/// Implementations must make `remove` idempotent: removing directives that
/// are not present is success.
#[allow(async_fn_in_trait)]
pub trait PacketFilter {
    /// Installs the DNAT and MASQUERADE directives for `rule`.
    ///
    /// Fails with [`Error::PartialApply`] when the first directive was
    /// installed and the second was not.
    async fn apply(&self, rule: &ForwardRule) -> Result<()>;

    /// Deletes both directives for `rule`; missing directives are not an error.
    async fn remove(&self, rule: &ForwardRule) -> Result<()>;

    /// Clears every directive this filter manages, and nothing else.
    async fn flush_all(&self) -> Result<()>;
}

/// [`PacketFilter`] backed by the `nft` command line tool
#[derive(Debug, Clone)]
pub struct NftFilter {
    table: String,
    timeout: Duration,
}

impl NftFilter {
    /// `table` must already be validated with
    /// [`crate::validators::validate_table_name`].
    pub fn new(table: impl Into<String>, timeout: Duration) -> Self {
        Self {
            table: table.into(),
            timeout,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // JSON builders
    // ═══════════════════════════════════════════════════════════════════════════

    fn table_obj(&self) -> Value {
        json!({ "family": "ip", "name": self.table })
    }

    /// Declares the table and both nat chains. `add` is a no-op when they exist.
    fn setup_commands(&self) -> Vec<Value> {
        let mut cmds = vec![json!({ "add": { "table": self.table_obj() } })];
        for (name, prio) in [(PREROUTING, -100), (POSTROUTING, 100)] {
            cmds.push(json!({
                "add": {
                    "chain": {
                        "family": "ip",
                        "table": self.table,
                        "name": name,
                        "type": "nat",
                        "hook": name,
                        "prio": prio,
                        "policy": "accept"
                    }
                }
            }));
        }
        cmds
    }

    fn port_match(protocol: &str, port: u16) -> Value {
        json!({
            "match": {
                "left": { "payload": { "protocol": protocol, "field": "dport" } },
                "op": "==",
                "right": port
            }
        })
    }

    fn rule_add(&self, chain: &str, expr: &[Value], comment: &str) -> Value {
        json!({
            "add": {
                "rule": {
                    "family": "ip",
                    "table": self.table,
                    "chain": chain,
                    "expr": expr,
                    "comment": comment
                }
            }
        })
    }

    /// Ingress directive: match (protocol, external port), rewrite destination
    pub fn dnat_command(&self, rule: &ForwardRule) -> Value {
        let expr = [
            Self::port_match(rule.protocol.as_str(), rule.external_port),
            json!({
                "dnat": {
                    "addr": rule.destination.to_string(),
                    "port": rule.destination_port
                }
            }),
        ];
        self.rule_add(PREROUTING, &expr, &rule.tag())
    }

    /// Egress directive: match (protocol, destination, destination port), masquerade
    pub fn masquerade_command(&self, rule: &ForwardRule) -> Value {
        let expr = [
            json!({
                "match": {
                    "left": { "payload": { "protocol": "ip", "field": "daddr" } },
                    "op": "==",
                    "right": rule.destination.to_string()
                }
            }),
            Self::port_match(rule.protocol.as_str(), rule.destination_port),
            json!({ "masquerade": null }),
        ];
        self.rule_add(POSTROUTING, &expr, &rule.tag())
    }

    fn delete_command(&self, chain: &str, handle: u64) -> Value {
        json!({
            "delete": {
                "rule": {
                    "family": "ip",
                    "table": self.table,
                    "chain": chain,
                    "handle": handle
                }
            }
        })
    }

    /// The full batch a reconciliation of `rules` amounts to.
    ///
    /// Live application goes rule by rule so one bad rule cannot sink the
    /// others; this single-batch form is what `natfwd export` prints.
    pub fn ruleset_json(&self, rules: &[ForwardRule]) -> Value {
        let mut cmds = self.setup_commands();
        cmds.reserve(1 + rules.len() * 2);
        cmds.push(json!({ "flush": { "table": self.table_obj() } }));
        for rule in rules {
            cmds.push(self.dnat_command(rule));
            cmds.push(self.masquerade_command(rule));
        }
        json!({ "nftables": cmds })
    }

    /// Human-readable nft syntax for the table `rules` produce
    pub fn ruleset_text(&self, rules: &[ForwardRule]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "table ip {} {{", self.table);

        let _ = writeln!(out, "\tchain {PREROUTING} {{");
        let _ = writeln!(out, "\t\ttype nat hook prerouting priority dstnat; policy accept;");
        for rule in rules {
            let _ = writeln!(
                out,
                "\t\t{} dport {} dnat to {}:{} comment \"{}\"",
                rule.protocol,
                rule.external_port,
                rule.destination,
                rule.destination_port,
                rule.tag()
            );
        }
        let _ = writeln!(out, "\t}}");

        let _ = writeln!(out, "\tchain {POSTROUTING} {{");
        let _ = writeln!(out, "\t\ttype nat hook postrouting priority srcnat; policy accept;");
        for rule in rules {
            let _ = writeln!(
                out,
                "\t\tip daddr {} {} dport {} masquerade comment \"{}\"",
                rule.destination,
                rule.protocol,
                rule.destination_port,
                rule.tag()
            );
        }
        let _ = writeln!(out, "\t}}");
        out.push_str("}\n");
        out
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // nft execution
    // ═══════════════════════════════════════════════════════════════════════════

    /// Runs nft with `args`, optionally feeding `stdin`, under the timeout.
    async fn run_nft(&self, args: &[&str], stdin: Option<String>) -> Result<Vec<u8>> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let mut child = crate::elevation::create_elevated_nft_command(args)?
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn nft: {e}");
                // No stderr: a missing binary must not look like a missing table
                Error::Nftables {
                    message: format!("failed to spawn nft: {e}"),
                    stderr: None,
                    exit_code: None,
                }
            })?;

        let run = async {
            if let (Some(mut pipe), Some(payload)) = (child.stdin.take(), stdin) {
                pipe.write_all(payload.as_bytes()).await?;
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                error!("nft {:?} timed out after {:?}", args, self.timeout);
                Error::Timeout(self.timeout.as_secs())
            })??;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let message = parse_nft_errors(&stderr)
                .into_iter()
                .next()
                .unwrap_or_else(|| format!("nft exited with {}", output.status));
            Err(Error::Nftables {
                message,
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }

    async fn run_batch(&self, commands: Vec<Value>) -> Result<()> {
        let payload = serde_json::to_string(&json!({ "nftables": commands }))?;
        debug!("nft batch: {payload}");
        self.run_nft(&["--json", "-f", "-"], Some(payload)).await?;
        Ok(())
    }

    /// Lists the owned table as JSON, or `None` if it does not exist yet.
    async fn list_table(&self) -> Result<Option<Value>> {
        match self
            .run_nft(&["--json", "list", "table", "ip", &self.table], None)
            .await
        {
            Ok(stdout) => Ok(Some(serde_json::from_slice(&stdout)?)),
            Err(e) if e.nft_stderr().is_some_and(is_missing_object) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl PacketFilter for NftFilter {
    async fn apply(&self, rule: &ForwardRule) -> Result<()> {
        let mut ingress = self.setup_commands();
        ingress.push(self.dnat_command(rule));
        self.run_batch(ingress).await?;

        if let Err(e) = self.run_batch(vec![self.masquerade_command(rule)]).await {
            error!("Masquerade for [{rule}] failed after DNAT was installed: {e}");
            return Err(Error::PartialApply {
                applied: Directive::Dnat,
                failed: Directive::Masquerade,
                message: e.to_string(),
            });
        }

        info!("Applied forwarding rule [{rule}]");
        Ok(())
    }

    async fn remove(&self, rule: &ForwardRule) -> Result<()> {
        let Some(listing) = self.list_table().await? else {
            debug!("Table {} absent, nothing to remove for [{rule}]", self.table);
            return Ok(());
        };

        let handles = find_handles(&listing, &self.table, &rule.tag());
        if handles.is_empty() {
            debug!("No live directives for [{rule}]");
            return Ok(());
        }

        let deletes = handles
            .iter()
            .map(|(chain, handle)| self.delete_command(chain, *handle))
            .collect();
        match self.run_batch(deletes).await {
            Ok(()) => {
                info!("Removed {} directive(s) for [{rule}]", handles.len());
                Ok(())
            }
            // Deleted underneath us between list and delete
            Err(e) if e.nft_stderr().is_some_and(is_missing_object) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn flush_all(&self) -> Result<()> {
        let mut cmds = self.setup_commands();
        cmds.push(json!({ "flush": { "table": self.table_obj() } }));
        self.run_batch(cmds).await?;
        info!("Flushed table ip {}", self.table);
        Ok(())
    }
}

/// True when nft complains about a table, chain or rule that does not exist
fn is_missing_object(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such file or directory") || lower.contains("does not exist")
}

/// Collects `(chain, handle)` for rules in `table` whose comment is `tag`.
///
/// `listing` is the output of `nft --json list table ip <table>`.
pub fn find_handles(listing: &Value, table: &str, tag: &str) -> Vec<(String, u64)> {
    listing
        .get("nftables")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("rule"))
        .filter(|rule| {
            rule.get("table").and_then(Value::as_str) == Some(table)
                && rule.get("comment").and_then(Value::as_str) == Some(tag)
        })
        .filter_map(|rule| {
            let chain = rule.get("chain")?.as_str()?;
            let handle = rule.get("handle")?.as_u64()?;
            Some((chain.to_string(), handle))
        })
        .collect()
}

/// Parses nft error output into user-friendly messages
///
/// Attempts to extract meaningful error information from nft's
/// stderr output, falling back to raw output if parsing fails.
fn parse_nft_errors(stderr: &str) -> Vec<String> {
    if let Ok(json_err) = serde_json::from_str::<Value>(stderr)
        && let Some(errors) = json_err.get("errors").and_then(|e| e.as_array())
    {
        return errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect();
    }

    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.trim_start_matches("Error: ")
                .trim_start_matches("nft: ")
                .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> NftFilter {
        NftFilter::new("natfwd", Duration::from_secs(5))
    }

    fn rule(line: &str) -> ForwardRule {
        line.parse().unwrap()
    }

    #[test]
    fn test_dnat_command_shape() {
        let cmd = filter().dnat_command(&rule("tcp 8080 10.0.0.5 80"));
        let r = &cmd["add"]["rule"];
        assert_eq!(r["family"], "ip");
        assert_eq!(r["table"], "natfwd");
        assert_eq!(r["chain"], "prerouting");
        assert_eq!(r["comment"], "natfwd:tcp:8080:10.0.0.5:80");

        let expr = r["expr"].as_array().unwrap();
        assert_eq!(expr.len(), 2);
        assert_eq!(expr[0]["match"]["left"]["payload"]["protocol"], "tcp");
        assert_eq!(expr[0]["match"]["right"], 8080);
        assert_eq!(expr[1]["dnat"]["addr"], "10.0.0.5");
        assert_eq!(expr[1]["dnat"]["port"], 80);
    }

    #[test]
    fn test_delete_command_shape() {
        let cmd = filter().delete_command(POSTROUTING, 42);
        assert_eq!(
            cmd,
            json!({
                "delete": {
                    "rule": {
                        "family": "ip",
                        "table": "natfwd",
                        "chain": "postrouting",
                        "handle": 42
                    }
                }
            })
        );
    }

    #[test]
    fn test_masquerade_command_shape() {
        let cmd = filter().masquerade_command(&rule("udp 53 10.0.0.2 5353"));
        let r = &cmd["add"]["rule"];
        assert_eq!(r["chain"], "postrouting");

        let expr = r["expr"].as_array().unwrap();
        assert_eq!(expr.len(), 3);
        assert_eq!(expr[0]["match"]["left"]["payload"]["field"], "daddr");
        assert_eq!(expr[0]["match"]["right"], "10.0.0.2");
        assert_eq!(expr[1]["match"]["left"]["payload"]["protocol"], "udp");
        assert_eq!(expr[1]["match"]["right"], 5353);
        assert!(expr[2].get("masquerade").is_some());
    }

    #[test]
    fn test_setup_declares_owned_chains_only() {
        let cmds = filter().setup_commands();
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0]["add"]["table"]["name"], "natfwd");
        assert_eq!(cmds[1]["add"]["chain"]["hook"], "prerouting");
        assert_eq!(cmds[1]["add"]["chain"]["prio"], -100);
        assert_eq!(cmds[2]["add"]["chain"]["hook"], "postrouting");
        assert_eq!(cmds[2]["add"]["chain"]["type"], "nat");
    }

    #[test]
    fn test_ruleset_json_flushes_then_adds_in_order() {
        let rules = [rule("tcp 8080 10.0.0.5 80"), rule("udp 53 10.0.0.2 53")];
        let json = filter().ruleset_json(&rules);
        let cmds = json["nftables"].as_array().unwrap();

        // table + 2 chains + flush + 2 directives per rule
        assert_eq!(cmds.len(), 4 + 4);
        assert_eq!(cmds[3]["flush"]["table"]["name"], "natfwd");
        assert_eq!(cmds[4]["add"]["rule"]["comment"], rules[0].tag());
        assert_eq!(cmds[5]["add"]["rule"]["chain"], "postrouting");
        assert_eq!(cmds[6]["add"]["rule"]["comment"], rules[1].tag());
    }

    #[test]
    fn test_ruleset_text() {
        let text = filter().ruleset_text(&[rule("tcp 8080 10.0.0.5 80")]);
        assert!(text.starts_with("table ip natfwd {"));
        assert!(text.contains("tcp dport 8080 dnat to 10.0.0.5:80"));
        assert!(text.contains("ip daddr 10.0.0.5 tcp dport 80 masquerade"));
    }

    #[test]
    fn test_find_handles_matches_comment_and_table() {
        let listing = json!({
            "nftables": [
                { "metainfo": { "json_schema_version": 1 } },
                { "table": { "family": "ip", "name": "natfwd", "handle": 1 } },
                { "chain": { "family": "ip", "table": "natfwd", "name": "prerouting", "handle": 1 } },
                { "rule": { "family": "ip", "table": "natfwd", "chain": "prerouting", "handle": 4,
                            "comment": "natfwd:tcp:8080:10.0.0.5:80", "expr": [] } },
                { "rule": { "family": "ip", "table": "natfwd", "chain": "prerouting", "handle": 5,
                            "comment": "natfwd:tcp:9090:10.0.0.5:80", "expr": [] } },
                { "rule": { "family": "ip", "table": "natfwd", "chain": "postrouting", "handle": 7,
                            "comment": "natfwd:tcp:8080:10.0.0.5:80", "expr": [] } },
                { "rule": { "family": "ip", "table": "other", "chain": "postrouting", "handle": 9,
                            "comment": "natfwd:tcp:8080:10.0.0.5:80", "expr": [] } }
            ]
        });

        let handles = find_handles(&listing, "natfwd", "natfwd:tcp:8080:10.0.0.5:80");
        assert_eq!(
            handles,
            vec![("prerouting".to_string(), 4), ("postrouting".to_string(), 7)]
        );
    }

    #[test]
    fn test_find_handles_tolerates_garbage() {
        assert!(find_handles(&json!({}), "natfwd", "x").is_empty());
        assert!(find_handles(&json!({ "nftables": [ { "rule": {} } ] }), "natfwd", "x").is_empty());
    }

    #[test]
    fn test_is_missing_object() {
        assert!(is_missing_object(
            "Error: No such file or directory\nlist table ip natfwd\n"
        ));
        assert!(!is_missing_object("Error: Operation not permitted"));
    }

    #[test]
    fn test_parse_nft_errors_plain_text() {
        let stderr = "Error: syntax error, unexpected $end\nError: invalid expression\n";
        let errors = parse_nft_errors(stderr);

        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], "syntax error, unexpected $end");
        assert_eq!(errors[1], "invalid expression");
    }

    #[test]
    fn test_parse_nft_errors_json() {
        let stderr = r#"{"errors":[{"message":"Could not process rule"}]}"#;
        assert_eq!(parse_nft_errors(stderr), vec!["Could not process rule"]);
    }
}
