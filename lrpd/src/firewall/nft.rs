//! nftables implementation of the loop-avoidance chain.
//!
//! Changes are rendered as nft scripts and piped to `nft -f -`, so each
//! call applies atomically. The chain is read back with `nft -j`.

use super::{Allow, CatchAll, ChainRule, Firewall, FirewallError, Result, RuleMatch, RuleOp};
use crate::address::{self, Subnet};
use serde::Deserialize;
use serde_json::Value;
use smoltcp::wire::EthernetAddress;
use std::fmt::Write as _;
use std::io::Write as _;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

const REDIRECT_COMMENT: &str = "lrpd: loop avoidance";
const DIVERT_COMMENT: &str = "lrpd: divert non-routables";

/// nft-backed firewall for one dedicated chain.
#[derive(Debug, Clone)]
pub struct NftFirewall {
    table: String,
    forward_chain: String,
    chain: String,
    queue_num: u16,
}

impl NftFirewall {
    pub fn new(table: &str, forward_chain: &str, chain: &str, queue_num: u16) -> Self {
        NftFirewall {
            table: table.to_string(),
            forward_chain: forward_chain.to_string(),
            chain: chain.to_string(),
            queue_num,
        }
    }

    /// JSON listing of `chain`, or `None` when the chain (or table) is absent.
    fn list_chain(&self, chain: &str) -> Result<Option<String>> {
        let output = Command::new("nft")
            .args(["-j", "list", "chain", "ip", &self.table, chain])
            .output()
            .map_err(FirewallError::Command)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such file") {
                return Ok(None);
            }
            return Err(FirewallError::NftFailed(stderr.to_string()));
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    /// Handles of forward-chain rules jumping to the dedicated chain.
    fn redirect_handles(&self) -> Result<Vec<u64>> {
        match self.list_chain(&self.forward_chain)? {
            Some(json) => jump_handles(&json, &self.chain),
            None => Ok(Vec::new()),
        }
    }

    fn install_script(&self, catch_all: CatchAll, stale: &[u64]) -> String {
        let (t, f, c) = (&self.table, &self.forward_chain, &self.chain);
        let mut script = String::new();
        let _ = writeln!(script, "add table ip {t}");
        let _ = writeln!(
            script,
            "add chain ip {t} {f} {{ type filter hook forward priority 0; }}"
        );
        let _ = writeln!(script, "add chain ip {t} {c}");
        let _ = writeln!(script, "flush chain ip {t} {c}");
        for handle in stale {
            let _ = writeln!(script, "delete rule ip {t} {f} handle {handle}");
        }
        let _ = writeln!(
            script,
            "insert rule ip {t} {f} jump {c} comment \"{REDIRECT_COMMENT}\""
        );
        let scope = match catch_all {
            CatchAll::Everything => String::new(),
            CatchAll::Towards(network) => format!("ip daddr {network} "),
        };
        let _ = writeln!(
            script,
            "add rule ip {t} {c} {scope}queue num {} comment \"{DIVERT_COMMENT}\"",
            self.queue_num
        );
        script
    }

    fn uninstall_script(&self, redirects: &[u64], chain_present: bool) -> String {
        let (t, f, c) = (&self.table, &self.forward_chain, &self.chain);
        let mut script = String::new();
        for handle in redirects {
            let _ = writeln!(script, "delete rule ip {t} {f} handle {handle}");
        }
        if chain_present {
            let _ = writeln!(script, "flush chain ip {t} {c}");
            let _ = writeln!(script, "delete chain ip {t} {c}");
        }
        script
    }

    fn ops_script(&self, ops: &[RuleOp]) -> String {
        let (t, c) = (&self.table, &self.chain);
        let mut script = String::new();
        for op in ops {
            let _ = match op {
                RuleOp::Insert(allow) => {
                    let matcher = match allow {
                        Allow::FromPredecessor { link, .. } => {
                            format!("ether saddr {}", mac_string(*link))
                        }
                        Allow::Towards(destination) => format!("ip daddr {destination}"),
                    };
                    writeln!(
                        script,
                        "insert rule ip {t} {c} {matcher} accept comment \"{}\"",
                        allow.comment()
                    )
                }
                RuleOp::Delete(handle) => writeln!(script, "delete rule ip {t} {c} handle {handle}"),
            };
        }
        script
    }
}

impl Firewall for NftFirewall {
    fn install(&mut self, catch_all: CatchAll) -> Result<()> {
        let stale = self.redirect_handles()?;
        if !stale.is_empty() {
            warn!(count = stale.len(), chain = %self.chain, "Dropping stale redirect rules");
        }
        run_script(&self.install_script(catch_all, &stale))?;
        info!(
            table = %self.table,
            chain = %self.chain,
            queue = self.queue_num,
            "Loop avoidance chain installed"
        );
        Ok(())
    }

    fn uninstall(&mut self) -> Result<()> {
        let redirects = self.redirect_handles()?;
        let chain_present = self.list_chain(&self.chain)?.is_some();
        if redirects.is_empty() && !chain_present {
            return Ok(());
        }
        run_script(&self.uninstall_script(&redirects, chain_present))?;
        info!(table = %self.table, chain = %self.chain, "Loop avoidance chain removed");
        Ok(())
    }

    fn rules(&mut self) -> Result<Vec<ChainRule>> {
        match self.list_chain(&self.chain)? {
            Some(json) => parse_chain(&json),
            None => Ok(Vec::new()),
        }
    }

    fn commit(&mut self, ops: &[RuleOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        run_script(&self.ops_script(ops))
    }
}

/// Feed `script` to `nft -f -`.
fn run_script(script: &str) -> Result<()> {
    debug!(script, "nft -f -");
    let mut child = Command::new("nft")
        .args(["-f", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(FirewallError::Command)?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .map_err(FirewallError::Command)?;
    }

    let output = child.wait_with_output().map_err(FirewallError::Command)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FirewallError::NftFailed(stderr.to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct Listing {
    #[serde(default)]
    nftables: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ListedRule {
    handle: u64,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    expr: Vec<Value>,
}

fn listed_rules(json: &str) -> Result<Vec<ListedRule>> {
    let listing: Listing = serde_json::from_str(json)?;
    listing
        .nftables
        .into_iter()
        .filter_map(|mut entry| entry.get_mut("rule").map(Value::take))
        .map(|rule| serde_json::from_value(rule).map_err(FirewallError::from))
        .collect()
}

fn parse_chain(json: &str) -> Result<Vec<ChainRule>> {
    Ok(listed_rules(json)?
        .into_iter()
        .map(|rule| ChainRule {
            handle: rule.handle,
            matcher: classify(&rule.expr),
            comment: rule.comment,
        })
        .collect())
}

fn jump_handles(json: &str, target: &str) -> Result<Vec<u64>> {
    Ok(listed_rules(json)?
        .into_iter()
        .filter(|rule| {
            rule.expr.iter().any(|e| {
                e.get("jump")
                    .and_then(|jump| jump.get("target"))
                    .and_then(Value::as_str)
                    == Some(target)
            })
        })
        .map(|rule| rule.handle)
        .collect())
}

/// Recognize the rule shapes this crate writes; anything else is `Other`.
fn classify(expr: &[Value]) -> RuleMatch {
    let mut link = None;
    let mut towards = None;
    let mut accept = false;
    let mut queue = false;

    for statement in expr {
        if let Some(matched) = statement.get("match") {
            let Some(payload) = matched.get("left").and_then(|left| left.get("payload")) else {
                continue;
            };
            let right = matched.get("right");
            match (
                payload.get("protocol").and_then(Value::as_str),
                payload.get("field").and_then(Value::as_str),
            ) {
                (Some("ether"), Some("saddr")) => {
                    link = right.and_then(Value::as_str).and_then(parse_mac);
                }
                (Some("ip"), Some("daddr")) => towards = right.and_then(parse_subnet_value),
                _ => return RuleMatch::Other,
            }
        } else if statement.get("accept").is_some() {
            accept = true;
        } else if statement.get("queue").is_some() {
            queue = true;
        }
    }

    if queue {
        return RuleMatch::Divert;
    }
    if !accept {
        return RuleMatch::Other;
    }
    match (link, towards) {
        (Some(link), None) => RuleMatch::FromLink(link),
        (None, Some(destination)) => RuleMatch::Towards(destination),
        _ => RuleMatch::Other,
    }
}

/// `"10.0.0.9"` or `{"prefix": {"addr": "10.0.0.0", "len": 16}}`.
fn parse_subnet_value(value: &Value) -> Option<Subnet> {
    if let Some(text) = value.as_str() {
        return address::parse_subnet(text).ok();
    }
    let prefix = value.get("prefix")?;
    let addr = prefix.get("addr")?.as_str()?.parse().ok()?;
    let len = u8::try_from(prefix.get("len")?.as_u64()?).ok()?;
    address::subnet(addr, len)
}

/// Colon-separated form nft expects (smoltcp's `Display` uses dashes).
fn mac_string(link: EthernetAddress) -> String {
    let m = link.0;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        m[0], m[1], m[2], m[3], m[4], m[5]
    )
}

fn parse_mac(text: &str) -> Option<EthernetAddress> {
    let mut bytes = [0u8; 6];
    let mut parts = text.split(':');
    for byte in &mut bytes {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(EthernetAddress(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::host_subnet;
    use crate::firewall::predecessor_comment;
    use std::net::Ipv4Addr;

    const LISTING: &str = r#"{"nftables": [
        {"metainfo": {"version": "1.0.9", "release_name": "Old Doc Yak #3", "json_schema_version": 1}},
        {"chain": {"family": "ip", "table": "filter", "name": "LRP", "handle": 7}},
        {"rule": {"family": "ip", "table": "filter", "chain": "LRP", "handle": 12,
            "comment": "allow towards destination 10.0.0.9/32",
            "expr": [
                {"match": {"op": "==", "left": {"payload": {"protocol": "ip", "field": "daddr"}}, "right": "10.0.0.9"}},
                {"accept": null}]}},
        {"rule": {"family": "ip", "table": "filter", "chain": "LRP", "handle": 11,
            "comment": "allow from predecessor 10.0.0.1",
            "expr": [
                {"match": {"op": "==", "left": {"payload": {"protocol": "ether", "field": "saddr"}}, "right": "02:00:00:00:00:01"}},
                {"accept": null}]}},
        {"rule": {"family": "ip", "table": "filter", "chain": "LRP", "handle": 10,
            "comment": "allow towards destination 10.2.0.0/16",
            "expr": [
                {"match": {"op": "==", "left": {"payload": {"protocol": "ip", "field": "daddr"}}, "right": {"prefix": {"addr": "10.2.0.0", "len": 16}}}},
                {"accept": null}]}},
        {"rule": {"family": "ip", "table": "filter", "chain": "LRP", "handle": 9,
            "comment": "lrpd: divert non-routables",
            "expr": [
                {"match": {"op": "==", "left": {"payload": {"protocol": "ip", "field": "daddr"}}, "right": {"prefix": {"addr": "10.0.0.0", "len": 8}}}},
                {"queue": {"num": 43}}]}}
    ]}"#;

    fn firewall() -> NftFirewall {
        NftFirewall::new("filter", "FORWARD", "LRP", 43)
    }

    #[test]
    fn test_parse_chain() {
        let rules = parse_chain(LISTING).unwrap();
        assert_eq!(rules.len(), 4);

        assert_eq!(rules[0].handle, 12);
        assert!(rules[0].accepts_towards(host_subnet(Ipv4Addr::new(10, 0, 0, 9))));

        assert_eq!(rules[1].handle, 11);
        assert!(rules[1].accepts_from(EthernetAddress([0x02, 0, 0, 0, 0, 0x01])));
        assert!(rules[1].has_comment("allow from predecessor 10.0.0.1"));

        assert!(rules[2].accepts_towards(address::parse_subnet("10.2.0.0/16").unwrap()));

        // The sink catch-all is scoped by destination but is not an allowance
        assert_eq!(rules[3].matcher, RuleMatch::Divert);
    }

    #[test]
    fn test_unknown_shapes_are_other() {
        let json = r#"{"nftables": [
            {"rule": {"family": "ip", "table": "filter", "chain": "LRP", "handle": 3,
                "expr": [
                    {"match": {"op": "==", "left": {"meta": {"key": "iifname"}}, "right": "eth0"}},
                    {"accept": null}]}},
            {"rule": {"family": "ip", "table": "filter", "chain": "LRP", "handle": 4,
                "expr": [
                    {"match": {"op": "==", "left": {"payload": {"protocol": "ip", "field": "daddr"}}, "right": "10.0.0.1"}},
                    {"drop": null}]}}
        ]}"#;
        let rules = parse_chain(json).unwrap();
        assert_eq!(rules[0].matcher, RuleMatch::Other);
        assert_eq!(rules[1].matcher, RuleMatch::Other);
    }

    #[test]
    fn test_jump_handles() {
        let json = r#"{"nftables": [
            {"chain": {"family": "ip", "table": "filter", "name": "FORWARD", "handle": 1}},
            {"rule": {"family": "ip", "table": "filter", "chain": "FORWARD", "handle": 5,
                "expr": [{"jump": {"target": "LRP"}}]}},
            {"rule": {"family": "ip", "table": "filter", "chain": "FORWARD", "handle": 6,
                "expr": [{"jump": {"target": "DOCKER"}}]}},
            {"rule": {"family": "ip", "table": "filter", "chain": "FORWARD", "handle": 8,
                "expr": [{"jump": {"target": "LRP"}}]}}
        ]}"#;
        assert_eq!(jump_handles(json, "LRP").unwrap(), vec![5, 8]);
        assert!(jump_handles(r#"{"nftables": []}"#, "LRP").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_listing() {
        assert!(matches!(parse_chain("not json"), Err(FirewallError::Json(_))));
    }

    #[test]
    fn test_install_script_router() {
        let script = firewall().install_script(CatchAll::Everything, &[]);
        assert_eq!(
            script,
            "add table ip filter\n\
             add chain ip filter FORWARD { type filter hook forward priority 0; }\n\
             add chain ip filter LRP\n\
             flush chain ip filter LRP\n\
             insert rule ip filter FORWARD jump LRP comment \"lrpd: loop avoidance\"\n\
             add rule ip filter LRP queue num 43 comment \"lrpd: divert non-routables\"\n"
        );
    }

    #[test]
    fn test_install_script_sink_drops_stale_redirects() {
        let network = address::parse_subnet("10.0.0.0/8").unwrap();
        let script = firewall().install_script(CatchAll::Towards(network), &[5, 8]);
        assert!(script.contains("delete rule ip filter FORWARD handle 5\n"));
        assert!(script.contains("delete rule ip filter FORWARD handle 8\n"));
        assert!(script.contains("add rule ip filter LRP ip daddr 10.0.0.0/8 queue num 43"));

        // Stale redirects go before the fresh one
        let stale = script.find("handle 8").unwrap();
        let fresh = script.find("insert rule").unwrap();
        assert!(stale < fresh);
    }

    #[test]
    fn test_ops_script() {
        let ops = [
            RuleOp::Insert(Allow::FromPredecessor {
                link: EthernetAddress([0x02, 0, 0, 0, 0, 0x01]),
                predecessor: Ipv4Addr::new(10, 0, 0, 1),
            }),
            RuleOp::Insert(Allow::Towards(host_subnet(Ipv4Addr::new(10, 0, 0, 9)))),
            RuleOp::Delete(12),
        ];
        assert_eq!(
            firewall().ops_script(&ops),
            "insert rule ip filter LRP ether saddr 02:00:00:00:00:01 accept comment \"allow from predecessor 10.0.0.1\"\n\
             insert rule ip filter LRP ip daddr 10.0.0.9/32 accept comment \"allow towards destination 10.0.0.9/32\"\n\
             delete rule ip filter LRP handle 12\n"
        );
    }

    #[test]
    fn test_uninstall_script() {
        assert_eq!(
            firewall().uninstall_script(&[5], true),
            "delete rule ip filter FORWARD handle 5\n\
             flush chain ip filter LRP\n\
             delete chain ip filter LRP\n"
        );
        assert_eq!(firewall().uninstall_script(&[5], false), "delete rule ip filter FORWARD handle 5\n");
    }

    /// Listing entry nft prints back for a rule inserted by `ops_script`.
    fn listed(handle: u64, script_line: &str) -> String {
        let (matcher, comment) = script_line.split_once(" accept comment ").unwrap();
        let mut words = matcher.rsplit(' ');
        let right = words.next().unwrap();
        let field = words.next().unwrap();
        let protocol = words.next().unwrap();
        format!(
            r#"{{"rule": {{"family": "ip", "table": "filter", "chain": "LRP", "handle": {handle},
                "comment": {comment},
                "expr": [
                    {{"match": {{"op": "==", "left": {{"payload": {{"protocol": "{protocol}", "field": "{field}"}}}}, "right": "{right}"}}}},
                    {{"accept": null}}]}}}}"#
        )
    }

    #[test]
    fn test_predecessor_rule_round_trip() {
        let link = EthernetAddress([0x02, 0xab, 0, 0, 0x0c, 0x01]);
        let predecessor = Ipv4Addr::new(10, 0, 0, 1);
        let script = firewall().ops_script(&[RuleOp::Insert(Allow::FromPredecessor {
            link,
            predecessor,
        })]);
        assert!(script.contains("ether saddr 02:ab:00:00:0c:01 accept"));

        let json = format!(r#"{{"nftables": [{}]}}"#, listed(21, script.trim_end()));
        let rules = parse_chain(&json).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].matcher, RuleMatch::FromLink(link));
        assert!(rules[0].accepts_from(link));
        assert!(rules[0].has_comment(&predecessor_comment(predecessor)));

        // Revoking by handle renders a delete of that rule only
        assert_eq!(
            firewall().ops_script(&[RuleOp::Delete(rules[0].handle)]),
            "delete rule ip filter LRP handle 21\n"
        );
    }

    #[test]
    fn test_mac_string() {
        assert_eq!(
            mac_string(EthernetAddress([0xaa, 0xbb, 0xcc, 0x0d, 0xee, 0xff])),
            "aa:bb:cc:0d:ee:ff"
        );
        let link = EthernetAddress([0x02, 0, 0, 0, 0, 0x07]);
        assert_eq!(parse_mac(&mac_string(link)), Some(link));
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff"),
            Some(EthernetAddress([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]))
        );
        assert_eq!(parse_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff:00"), None);
        assert_eq!(parse_mac("zz:bb:cc:dd:ee:ff"), None);
    }
}
