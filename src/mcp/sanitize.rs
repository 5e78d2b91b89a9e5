/// Lowercases and replaces any character outside `[a-z0-9_]` with `_`,
/// collapsing runs so `"My Server!!"` becomes `"my_server_"` → `"my_server"`.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_underscore = false;
    for ch in raw.chars() {
        let lowered = ch.to_ascii_lowercase();
        if lowered.is_ascii_alphanumeric() || lowered == '_' {
            out.push(lowered);
            last_was_underscore = lowered == '_';
        } else if !last_was_underscore {
            out.push('_');
            last_was_underscore = true;
        }
    }
    out.trim_matches('_').to_string()
}

pub fn proxy_tool_name(server: &str, remote: &str) -> String {
    format!("mcp_{}_{}", sanitize(server), sanitize(remote))
}

/// `name` matches the allowlist if it is empty, contains a literal
/// match, or contains a `prefix*` wildcard matching `name`.
pub fn allowed(name: &str, list: &[String]) -> bool {
    if list.is_empty() {
        return true;
    }
    list.iter().any(|entry| {
        if let Some(prefix) = entry.strip_suffix('*') {
            name.starts_with(prefix)
        } else {
            entry == name
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_and_lowercases() {
        assert_eq!(sanitize("My Server!!"), "my_server");
        assert_eq!(sanitize("fetch-url"), "fetch_url");
        assert_eq!(sanitize("ALREADY_OK"), "already_ok");
    }

    #[test]
    fn proxy_tool_name_joins_sanitized_parts() {
        assert_eq!(proxy_tool_name("GitHub", "search repos"), "mcp_github_search_repos");
    }

    #[test]
    fn allowed_supports_empty_literal_and_wildcard() {
        assert!(allowed("anything", &[]));
        assert!(allowed("search", &["search".to_string()]));
        assert!(!allowed("other", &["search".to_string()]));
        assert!(allowed("search_repos", &["search*".to_string()]));
    }
}
