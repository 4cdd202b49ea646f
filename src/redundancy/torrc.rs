//! Per-instance torrc generation
//!
//! Instance configs are derived from one base template. The instance's
//! ports and data directory replace the template's, then the isolation
//! sub-ports, hidden services, nickname and region routing hints are
//! appended.

use crate::config::{HiddenServiceConfig, InstanceConfig};
use crate::isolation::IsolationConfig;

/// Used when no template file is configured
pub const DEFAULT_TEMPLATE: &str = "\
## Base configuration for supervised instances
SocksPort 9050
ControlPort 9051
DataDirectory /var/lib/tor
CookieAuthentication 1
AvoidDiskWrites 1
Log notice stdout
";

/// Directives owned by the generator; template values are replaced
const MANAGED_DIRECTIVES: [&str; 5] = [
    "socksport",
    "controlport",
    "datadirectory",
    "hiddenservicedir",
    "hiddenserviceport",
];

/// Country sets for region tags
fn region_nodes(region: &str) -> Option<&'static str> {
    let prefix = region.split('-').next().unwrap_or(region);
    match prefix {
        "us" => Some("{us}"),
        "ca" => Some("{ca}"),
        "eu" => Some("{de},{nl},{fr},{se},{ch}"),
        "ap" => Some("{jp},{sg},{au}"),
        _ => None,
    }
}

/// Tor nicknames are 1-19 alphanumeric characters
fn nickname(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(19)
        .collect();
    if cleaned.is_empty() {
        "torha".to_string()
    } else {
        cleaned
    }
}

fn directive(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    trimmed
        .split_whitespace()
        .next()
        .map(|d| d.to_ascii_lowercase())
}

/// Render the torrc for one instance
pub fn render(
    template: &str,
    instance: &InstanceConfig,
    services: &[HiddenServiceConfig],
    isolation: &IsolationConfig,
) -> String {
    let mut out: Vec<String> = template
        .lines()
        .filter(|line| {
            directive(line)
                .map(|d| !MANAGED_DIRECTIVES.contains(&d.as_str()))
                .unwrap_or(true)
        })
        .map(str::to_string)
        .collect();

    while out.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        out.pop();
    }

    out.push(String::new());
    out.push(format!("## Instance {}", instance.id));
    out.push(format!("SocksPort {}", instance.proxy_port));
    out.extend(isolation.torrc_lines(instance.proxy_port));
    out.push(format!("ControlPort {}", instance.control_port));
    out.push(format!("DataDirectory {}", instance.data_dir));
    out.push(format!("Nickname {}", nickname(&instance.name)));

    for name in &instance.hidden_services {
        let Some(service) = services.iter().find(|s| &s.name == name) else {
            log::warn!("⚠️ Instance {} lists unknown hidden service {}", instance.id, name);
            continue;
        };
        out.push(format!("HiddenServiceDir {}/{}", instance.data_dir, service.name));
        out.push(format!(
            "HiddenServicePort {} {}",
            service.virtual_port, service.target
        ));
    }

    if let Some(region) = &instance.region {
        match region_nodes(region) {
            Some(nodes) => {
                out.push(format!("EntryNodes {}", nodes));
                out.push(format!("ExitNodes {}", nodes));
                out.push("StrictNodes 0".to_string());
            }
            None => log::warn!("⚠️ No node set for region {}, leaving routing open", region),
        }
    }

    out.push(String::new());
    out.join("\n")
}

/// First `SocksPort` and `ControlPort` values in a torrc
pub fn extract_ports(torrc: &str) -> Option<(u16, u16)> {
    let mut socks = None;
    let mut control = None;

    for line in torrc.lines() {
        let Some(d) = directive(line) else {
            continue;
        };
        let slot = match d.as_str() {
            "socksport" if socks.is_none() => &mut socks,
            "controlport" if control.is_none() => &mut control,
            _ => continue,
        };
        // Value may be `9050` or `127.0.0.1:9050`, followed by flags
        *slot = line
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.rsplit(':').next())
            .and_then(|p| p.parse::<u16>().ok());
    }

    Some((socks?, control?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedundancyConfig;

    #[test]
    fn test_ports_round_trip() {
        let config = RedundancyConfig::default();
        for instance in &config.instances {
            let torrc = render(
                DEFAULT_TEMPLATE,
                instance,
                &config.services,
                &IsolationConfig::default(),
            );
            assert_eq!(
                extract_ports(&torrc),
                Some((instance.proxy_port, instance.control_port)),
                "round trip for {}",
                instance.id
            );
        }
    }

    #[test]
    fn test_template_values_replaced() {
        let config = RedundancyConfig::default();
        let secondary = &config.instances[1];
        let torrc = render(
            DEFAULT_TEMPLATE,
            secondary,
            &config.services,
            &IsolationConfig::default(),
        );

        assert!(!torrc.contains("SocksPort 9050"));
        assert!(!torrc.contains("DataDirectory /var/lib/tor\n"));
        assert!(torrc.contains("DataDirectory /var/lib/tor-secondary"));
        assert!(torrc.contains("SocksPort 9062 IsolateDestAddr"));
        assert!(torrc.contains("Nickname torsecondary"));
        assert!(torrc.contains("HiddenServiceDir /var/lib/tor-secondary/main"));
        assert!(torrc.contains("HiddenServicePort 80 127.0.0.1:3001"));
        // Untouched template lines survive
        assert!(torrc.contains("CookieAuthentication 1"));
    }

    #[test]
    fn test_region_hints() {
        let config = RedundancyConfig::default();
        let eu = render(
            DEFAULT_TEMPLATE,
            &config.instances[2],
            &config.services,
            &IsolationConfig::disabled(),
        );
        assert!(eu.contains("ExitNodes {de}"));
        assert!(eu.contains("StrictNodes 0"));

        let primary = render(
            DEFAULT_TEMPLATE,
            &config.instances[0],
            &config.services,
            &IsolationConfig::disabled(),
        );
        assert!(!primary.contains("EntryNodes"));
    }

    #[test]
    fn test_extract_ports_with_address_and_flags() {
        let torrc = "# SocksPort 1\nSocksPort 127.0.0.1:9150 IsolateDestAddr\nControlPort 9151\n";
        assert_eq!(extract_ports(torrc), Some((9150, 9151)));
        assert_eq!(extract_ports("SocksPort 9050\n"), None);
    }

    #[test]
    fn test_nickname_sanitized() {
        assert_eq!(nickname("tor-primary"), "torprimary");
        assert_eq!(nickname("---"), "torha");
        assert_eq!(nickname(&"a".repeat(40)).len(), 19);
    }
}
