/// Environment hygiene for the interpreter process
///
/// The interpreter always starts from an empty environment. When the
/// `environment` capability is granted the host environment is passed
/// through minus loader and interpreter hooks.
use std::collections::BTreeMap;
use std::env;

/// Variables that change how the dynamic loader or the interpreter behave.
const DANGEROUS_PREFIXES: &[&str] = &["LD_", "PYTHON", "DYLD_"];

const BASELINE: &[(&str, &str)] = &[
    ("PATH", "/usr/local/bin:/usr/bin:/bin"),
    ("LANG", "C.UTF-8"),
    ("LC_ALL", "C.UTF-8"),
    ("PYTHONIOENCODING", "utf-8"),
];

/// Environment for a run with no `environment` grant.
pub fn baseline_environment() -> BTreeMap<String, String> {
    BASELINE
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Host environment with dangerous variables removed, then the baseline
/// laid over it.
pub fn sanitized_host_environment() -> BTreeMap<String, String> {
    sanitize(env::vars())
}

fn sanitize<I: IntoIterator<Item = (String, String)>>(vars: I) -> BTreeMap<String, String> {
    let mut env_map: BTreeMap<String, String> = vars
        .into_iter()
        .filter(|(key, _)| {
            let dangerous = DANGEROUS_PREFIXES.iter().any(|p| key.starts_with(p));
            if dangerous {
                log::debug!("Dropping host environment variable {}", key);
            }
            !dangerous
        })
        .collect();
    env_map.extend(baseline_environment());
    env_map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_is_minimal() {
        let env_map = baseline_environment();
        assert_eq!(env_map.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert!(!env_map.contains_key("HOME"));
    }

    #[test]
    fn loader_and_interpreter_hooks_are_removed() {
        let env_map = sanitize(vec![
            ("LD_PRELOAD".to_string(), "/tmp/evil.so".to_string()),
            ("PYTHONPATH".to_string(), "/tmp".to_string()),
            ("PYTHONSTARTUP".to_string(), "/tmp/x.py".to_string()),
            ("GREETING".to_string(), "akwaaba".to_string()),
            ("PATH".to_string(), "/opt/evil".to_string()),
        ]);
        assert!(!env_map.contains_key("LD_PRELOAD"));
        assert!(!env_map.contains_key("PYTHONPATH"));
        assert!(!env_map.contains_key("PYTHONSTARTUP"));
        assert_eq!(env_map["GREETING"], "akwaaba");
        assert_eq!(env_map["PATH"], "/usr/local/bin:/usr/bin:/bin");
        assert_eq!(env_map["PYTHONIOENCODING"], "utf-8");
    }
}
