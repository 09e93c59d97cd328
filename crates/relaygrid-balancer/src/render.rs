//! HAProxy SNI config rendering.
//!
//! Layout, in this order: header, main SNI rules, node SNI rules, main
//! backends, node backends. Node entries follow registry order, so adding
//! a node appends one rule line and one backend block and removing it
//! deletes exactly those lines.

use relaygrid_core::config::{BalancerConfig, MainRuleConfig};
use relaygrid_registry::NodeRecord;

/// The main server's static part of the config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainServer {
    pub listen_port: u16,
    pub rules: Vec<MainRuleConfig>,
}

impl MainServer {
    pub fn from_config(config: &BalancerConfig) -> Self {
        Self {
            listen_port: config.listen_port,
            rules: config.main_rules.clone(),
        }
    }
}

const HEADER: &str = "\
# Managed by relaygrid. Manual edits are overwritten on the next sync.
global
    log /dev/log local0
    maxconn 4096

defaults
    mode tcp
    log global
    option tcplog
    timeout connect 5s
    timeout client 1m
    timeout server 1m
";

/// Render the full config. Pure: same input, same bytes.
pub fn render_config(main: &MainServer, records: &[NodeRecord]) -> String {
    let nodes: Vec<&NodeRecord> = records.iter().filter(|r| !r.state.is_removed()).collect();
    let mut out = String::from(HEADER);

    out.push_str("\nfrontend sni_in\n");
    out.push_str(&format!("    bind *:{}\n", main.listen_port));
    out.push_str("    tcp-request inspect-delay 5s\n");
    out.push_str("    tcp-request content accept if { req_ssl_hello_type 1 }\n");
    for (index, rule) in main.rules.iter().enumerate() {
        out.push_str(&sni_rule(&main_backend(index, &rule.domain), &rule.domain));
    }
    for node in &nodes {
        out.push_str(&sni_rule(&node_backend(&node.name), &node.domain));
    }

    for (index, rule) in main.rules.iter().enumerate() {
        out.push('\n');
        out.push_str(&backend_block(&main_backend(index, &rule.domain), "main", &rule.target));
    }
    for node in &nodes {
        out.push('\n');
        out.push_str(&backend_block(
            &node_backend(&node.name),
            &node.name,
            &node.backend_target(),
        ));
    }
    out
}

fn sni_rule(backend: &str, domain: &str) -> String {
    format!("    use_backend {backend} if {{ req_ssl_sni -i {domain} }}\n")
}

fn backend_block(backend: &str, server: &str, target: &str) -> String {
    format!("backend {backend}\n    server {server} {target}\n")
}

pub(crate) fn node_backend(name: &str) -> String {
    format!("node_{name}")
}

/// The rule index keeps names unique when two domains map to the same
/// identifier (`a-b.com` and `a.b.com`).
fn main_backend(index: usize, domain: &str) -> String {
    let id: String = domain
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    format!("main_{index}_{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygrid_core::Secret;
    use relaygrid_registry::{NodeState, SshAccess, SshCredential};

    fn main_server() -> MainServer {
        MainServer {
            listen_port: 443,
            rules: vec![MainRuleConfig {
                domain: "panel.example.com".to_string(),
                target: "127.0.0.1:8443".to_string(),
            }],
        }
    }

    fn node(name: &str, ip: &str, domain: &str) -> NodeRecord {
        let mut record = NodeRecord::pending(
            name,
            ip.parse().unwrap(),
            domain,
            443,
            SshAccess::new(
                "root",
                22,
                SshCredential::Password {
                    password: Secret::new("pw"),
                },
            ),
        );
        record.state = NodeState::Active;
        record.control_plane_node_id = Some(1);
        record
    }

    #[test]
    fn is_deterministic() {
        let nodes = vec![node("a", "10.0.0.1", "a.example.com")];
        assert_eq!(render_config(&main_server(), &nodes), render_config(&main_server(), &nodes));
    }

    #[test]
    fn node_rules_follow_main_rules() {
        let text = render_config(
            &main_server(),
            &[
                node("a", "10.0.0.1", "a.example.com"),
                node("b", "10.0.0.2", "b.example.com"),
            ],
        );
        let main_rule = text.find("req_ssl_sni -i panel.example.com").unwrap();
        let a_rule = text.find("req_ssl_sni -i a.example.com").unwrap();
        let b_rule = text.find("req_ssl_sni -i b.example.com").unwrap();
        let main_backend = text.find("backend main_0_panel_example_com").unwrap();
        let a_backend = text.find("backend node_a\n").unwrap();
        assert!(main_rule < a_rule && a_rule < b_rule);
        assert!(b_rule < main_backend && main_backend < a_backend);
        assert!(text.contains("    server a 10.0.0.1:443\n"));
        assert!(text.contains("    server main 127.0.0.1:8443\n"));
    }

    #[test]
    fn adding_then_removing_a_node_is_identity() {
        let a = node("a", "10.0.0.1", "a.example.com");
        let b = node("b", "10.0.0.2", "b.example.com");
        let before = render_config(&main_server(), std::slice::from_ref(&a));
        let with_b = render_config(&main_server(), &[a.clone(), b]);
        let after = render_config(&main_server(), &[a]);

        assert_eq!(before, after);
        // Addition only inserts lines.
        let added: Vec<&str> = with_b.lines().filter(|l| !before.lines().any(|x| x == *l)).collect();
        assert_eq!(
            added,
            vec![
                "    use_backend node_b if { req_ssl_sni -i b.example.com }",
                "backend node_b",
                "    server b 10.0.0.2:443",
            ]
        );
    }

    #[test]
    fn removed_records_are_not_routed() {
        let mut b = node("b", "10.0.0.2", "b.example.com");
        b.state = NodeState::Removed;
        b.control_plane_node_id = None;
        let text = render_config(&main_server(), &[node("a", "10.0.0.1", "a.example.com"), b]);
        assert!(!text.contains("b.example.com"));
        assert!(!text.contains("node_b"));
    }

    #[test]
    fn ipv6_backends_are_bracketed() {
        let text = render_config(&main_server(), &[node("v6", "fd00::9", "v6.example.com")]);
        assert!(text.contains("    server v6 [fd00::9]:443\n"));
    }

    #[test]
    fn similar_main_domains_get_distinct_backends() {
        let main = MainServer {
            listen_port: 443,
            rules: vec![
                MainRuleConfig {
                    domain: "a-b.com".to_string(),
                    target: "127.0.0.1:8001".to_string(),
                },
                MainRuleConfig {
                    domain: "a.b.com".to_string(),
                    target: "127.0.0.1:8002".to_string(),
                },
            ],
        };
        let text = render_config(&main, &[]);

        let backends: Vec<&str> = text.lines().filter(|l| l.starts_with("backend ")).collect();
        assert_eq!(backends, ["backend main_0_a_b_com", "backend main_1_a_b_com"]);
        assert!(text.contains("use_backend main_0_a_b_com if { req_ssl_sni -i a-b.com }"));
        assert!(text.contains("use_backend main_1_a_b_com if { req_ssl_sni -i a.b.com }"));
    }

    #[test]
    fn empty_fleet_keeps_main_rules() {
        let text = render_config(&main_server(), &[]);
        assert!(text.contains("bind *:443"));
        assert!(text.contains("panel.example.com"));
        assert!(!text.contains("node_"));
    }
}
