//! Built-in tunnel adapters

mod hysteria2;
mod tcp;
mod wireguard;

pub use hysteria2::Hysteria2Adapter;
pub use tcp::TcpAdapter;
pub use wireguard::WireguardAdapter;

use crate::adapter::AdapterError;
use smite_proto::TunnelSpec;
use std::path::Path;

/// Split `host:port`, accepting bracketed IPv6 hosts
pub(crate) fn parse_host_port(value: &str) -> Result<(&str, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}' is not host:port", value))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(format!("'{}' has an empty host", value));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| format!("'{}' has an invalid port", value))?;
    if port == 0 {
        return Err(format!("'{}' has port 0", value));
    }
    Ok((host, port))
}

/// Required string field that must be a usable `host:port`
pub(crate) fn require_host_port<'a>(spec: &'a TunnelSpec, key: &str) -> Result<&'a str, String> {
    let value = require_str(spec, key)?;
    parse_host_port(value).map_err(|e| format!("{}: {}", key, e))?;
    Ok(value)
}

/// Required non-empty string field safe to embed in a rendered config line
pub(crate) fn require_str<'a>(spec: &'a TunnelSpec, key: &str) -> Result<&'a str, String> {
    match spec.get(key) {
        None => Err(format!("missing required field '{}'", key)),
        Some(value) => {
            let text = value
                .as_str()
                .ok_or_else(|| format!("'{}' must be a string", key))?;
            check_line(key, text)?;
            if text.trim().is_empty() {
                return Err(format!("'{}' must not be empty", key));
            }
            Ok(text)
        }
    }
}

/// Optional string field; present but mistyped is an error
pub(crate) fn optional_str<'a>(spec: &'a TunnelSpec, key: &str) -> Result<Option<&'a str>, String> {
    match spec.get(key) {
        None => Ok(None),
        Some(value) => {
            let text = value
                .as_str()
                .ok_or_else(|| format!("'{}' must be a string", key))?;
            check_line(key, text)?;
            Ok(Some(text))
        }
    }
}

pub(crate) fn optional_u64(spec: &TunnelSpec, key: &str) -> Result<Option<u64>, String> {
    match spec.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("'{}' must be a non-negative integer", key)),
    }
}

pub(crate) fn optional_bool(spec: &TunnelSpec, key: &str) -> Result<Option<bool>, String> {
    match spec.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| format!("'{}' must be a boolean", key)),
    }
}

fn check_line(key: &str, text: &str) -> Result<(), String> {
    if text.contains(['\n', '\r']) {
        return Err(format!("'{}' must be a single line", key));
    }
    Ok(())
}

/// Replace a rendered config file atomically
pub(crate) async fn write_config(path: &Path, contents: String, private: bool) -> Result<(), AdapterError> {
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_config_blocking(&target, contents.as_bytes(), private))
        .await
        .map_err(|e| AdapterError::Backend(format!("config writer task failed: {}", e)))?
}

fn write_config_blocking(path: &Path, contents: &[u8], private: bool) -> Result<(), AdapterError> {
    use std::io::Write;

    let context = || format!("write {}", path.display());
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| AdapterError::io(context(), e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| AdapterError::io(context(), e))?;
    tmp.write_all(contents).map_err(|e| AdapterError::io(context(), e))?;
    tmp.as_file().sync_all().map_err(|e| AdapterError::io(context(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if private { 0o600 } else { 0o644 };
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))
            .map_err(|e| AdapterError::io(context(), e))?;
    }
    #[cfg(not(unix))]
    let _ = private;

    tmp.persist(path).map_err(|e| AdapterError::io(context(), e.error))?;
    Ok(())
}

/// Delete a rendered config file; a file that is already gone is fine
pub(crate) async fn delete_config(path: &Path) -> Result<bool, AdapterError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(AdapterError::io(format!("remove {}", path.display()), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: serde_json::Value) -> TunnelSpec {
        TunnelSpec::try_from(value).unwrap()
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("1.2.3.4:51820").unwrap(), ("1.2.3.4", 51820));
        assert_eq!(parse_host_port("[::1]:443").unwrap(), ("::1", 443));
        assert_eq!(parse_host_port("vpn.example.com:443").unwrap(), ("vpn.example.com", 443));

        assert!(parse_host_port("1.2.3.4").is_err());
        assert!(parse_host_port(":443").is_err());
        assert!(parse_host_port("host:0").is_err());
        assert!(parse_host_port("host:99999").is_err());
    }

    #[test]
    fn test_field_helpers() {
        let s = spec(json!({"a": "x", "n": 5, "b": true, "bad": "one\ntwo", "blank": " "}));

        assert_eq!(require_str(&s, "a").unwrap(), "x");
        assert!(require_str(&s, "missing").unwrap_err().contains("missing required"));
        assert!(require_str(&s, "n").unwrap_err().contains("must be a string"));
        assert!(require_str(&s, "bad").unwrap_err().contains("single line"));
        assert!(require_str(&s, "blank").is_err());

        assert_eq!(optional_u64(&s, "n").unwrap(), Some(5));
        assert!(optional_u64(&s, "a").is_err());
        assert_eq!(optional_bool(&s, "b").unwrap(), Some(true));
        assert_eq!(optional_str(&s, "missing").unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_and_delete_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("t1.conf");

        write_config(&path, "first".to_string(), true).await.unwrap();
        write_config(&path, "second".to_string(), true).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(delete_config(&path).await.unwrap());
        assert!(!delete_config(&path).await.unwrap());
    }
}
