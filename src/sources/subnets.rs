use crate::error::{Result, ScoutError};
use crate::types::AddressFamily;
use ipnet::IpNet;
use std::path::Path;
use tokio::fs;

/// Parse a CIDR list, one subnet per line.
///
/// Blank lines and `#` comments are ignored. Malformed lines are logged and
/// skipped, as are subnets of the other family.
pub fn parse_subnets(content: &str, family: AddressFamily) -> Vec<IpNet> {
    let mut subnets = Vec::new();
    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<IpNet>() {
            Ok(net) if family.matches(&net.network()) => subnets.push(net),
            Ok(net) => {
                tracing::debug!(%net, %family, "Skipping subnet of other family");
            }
            Err(e) => {
                tracing::warn!(line = lineno + 1, value = %line, error = %e, "Skipping malformed subnet");
            }
        }
    }
    subnets
}

/// Load the subnet list for `family`. An unreadable file or a list with no
/// usable subnet is an error.
pub async fn load_subnets(path: &Path, family: AddressFamily) -> Result<Vec<IpNet>> {
    let content = fs::read_to_string(path).await.map_err(|source| ScoutError::Input {
        path: path.to_path_buf(),
        source,
    })?;
    let subnets = parse_subnets(&content, family);
    if subnets.is_empty() {
        return Err(ScoutError::NoSubnets { family });
    }
    tracing::info!(count = subnets.len(), ?path, "Loaded subnets");
    Ok(subnets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_skips_garbage() {
        let input = r#"
# edge ranges
173.245.48.0/20
103.21.244.0/22   # trailing comment
not-a-subnet
104.16.0.0/33
2400:cb00::/32
198.51.100.7
        "#;
        let nets = parse_subnets(input, AddressFamily::V4);
        let shown: Vec<String> = nets.iter().map(|n| n.to_string()).collect();
        assert_eq!(shown, vec!["173.245.48.0/20", "103.21.244.0/22"]);

        let v6 = parse_subnets(input, AddressFamily::V6);
        assert_eq!(v6.len(), 1);
        assert_eq!(v6[0].to_string(), "2400:cb00::/32");
    }

    #[tokio::test]
    async fn test_load_errors() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ips-v4.txt");

        let err = load_subnets(&path, AddressFamily::V4).await.unwrap_err();
        assert!(matches!(err, ScoutError::Input { .. }));

        fs::write(&path, "# nothing useful\nbogus\n").await?;
        let err = load_subnets(&path, AddressFamily::V4).await.unwrap_err();
        assert!(matches!(err, ScoutError::NoSubnets { family: AddressFamily::V4 }));

        fs::write(&path, "192.0.2.0/24\n").await?;
        assert_eq!(load_subnets(&path, AddressFamily::V4).await?.len(), 1);
        Ok(())
    }
}
