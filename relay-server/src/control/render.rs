use crate::cluster::{ClusterMember, NodeIdentity};
use std::fmt::Write;

const TOP_RULE: &str =
    "======+=============================================+==========+===============\r\n";
const RULE: &str =
    "------+---------------------------------------------+----------+---------------\r\n";

/// Render the member table returned by `ShowMembers`
pub fn render_members(current: &NodeIdentity, members: &[ClusterMember]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "current node: {}\r", current);
    let _ = writeln!(out, "cluster size: {} node(s)\r", members.len());
    out.push_str(TOP_RULE);
    let _ = writeln!(out, "{:<6}| {:<43} | {:<8} | {}\r", "index", "node", "role", "status");
    out.push_str(RULE);

    for (index, member) in members.iter().enumerate() {
        let node = format!(
            "{}({}:{})",
            member.hostname, member.service_ip, member.port
        );
        let role = if member.is_leader { "leader" } else { "follower" };
        let _ = writeln!(
            out,
            "{:<6}| {:<43} | {:<8} | {}\r",
            index, node, role, member.status
        );
    }

    out.push_str(RULE);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemberStatus;

    fn member(host: &str, port: u16, leader: bool, status: MemberStatus) -> ClusterMember {
        ClusterMember {
            service_id: host.to_string(),
            hostname: host.to_string(),
            service_ip: "10.0.0.1".to_string(),
            port,
            is_leader: leader,
            status,
            session_id: host.to_string(),
        }
    }

    #[test]
    fn test_member_table() {
        let current = NodeIdentity {
            node_id: "x".to_string(),
            hostname: "relay-a".to_string(),
            service_ip: "10.0.0.1".to_string(),
            port: 9595,
        };
        let members = vec![
            member("relay-a", 9595, true, MemberStatus::Online),
            member("relay-b", 9596, false, MemberStatus::Offline),
        ];

        let table = render_members(&current, &members);
        let lines: Vec<&str> = table.split("\r\n").collect();

        assert_eq!(lines[0], "current node: relay-a(10.0.0.1:9595)");
        assert_eq!(lines[1], "cluster size: 2 node(s)");
        assert_eq!(lines[2], TOP_RULE.trim_end());
        assert!(lines[3].starts_with("index | node "));
        assert_eq!(
            lines[5],
            format!("{:<6}| {:<43} | {:<8} | online", 0, "relay-a(10.0.0.1:9595)", "leader")
        );
        assert!(lines[6].contains("| follower | offline"));
        assert_eq!(lines[7], RULE.trim_end());
        assert_eq!(lines[8], "");
    }

    #[test]
    fn test_empty_cluster() {
        let current = NodeIdentity {
            node_id: "x".to_string(),
            hostname: "solo".to_string(),
            service_ip: "127.0.0.1".to_string(),
            port: 1,
        };
        let table = render_members(&current, &[]);
        assert!(table.contains("cluster size: 0 node(s)\r\n"));
        assert_eq!(table.matches(RULE).count(), 2);
    }
}
