//! Rewrites model-proposed shell commands into workspace-scoped forms.

use std::sync::LazyLock;

use regex::Regex;

/// Directories excluded from file discovery.
pub const NOISY_DIRS: [&str; 3] = [".venv", "runs", ".git"];

const DEFAULT_LIST_LIMIT: usize = 20;

static FIND_BY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"find\s+\.\s+-type\s+f\s+-name\s+['"]([^'"]+)['"]"#).expect("find pattern")
});
static HEAD_LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"head\s+-(?:n\s*)?(\d+)").expect("head pattern"));
static RG_FILES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"rg\s+--files(?:\s+-g\s+["'][^"']+["'])+"#).expect("rg files pattern")
});
static RG_INCLUDE_GLOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"-g\s+["']([^!"'][^"']*)["']"#).expect("rg glob pattern"));
static RG_SEARCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"rg\s+"([^"]*)""#).expect("rg search pattern"));

/// Normalize a `run_command` command line.
///
/// With `rg` available, `find . -type f -name GLOB` becomes an `rg --files`
/// listing that skips [`NOISY_DIRS`]. Without it, `rg` invocations are
/// rewritten to `find`/`grep` equivalents.
pub fn normalize_command(command: &str, rg_available: bool) -> String {
    let normalized = command.trim();
    if rg_available {
        if let Some(caps) = FIND_BY_NAME.captures(normalized) {
            let glob = &caps[1];
            let limit = HEAD_LIMIT
                .captures(normalized)
                .and_then(|caps| caps[1].parse::<usize>().ok())
                .unwrap_or(DEFAULT_LIST_LIMIT);
            let excludes = NOISY_DIRS
                .iter()
                .map(|dir| format!("-g \"!{dir}/**\""))
                .collect::<Vec<_>>()
                .join(" ");
            return format!("rg --files -g \"{glob}\" {excludes} | head -n {limit}");
        }
        return normalized.to_string();
    }
    rewrite_without_rg(normalized)
}

/// `find` listing for `glob` that skips [`NOISY_DIRS`].
pub fn build_find_command(glob: &str, limit: Option<usize>) -> String {
    let excludes = NOISY_DIRS
        .iter()
        .map(|dir| format!("-not -path \"./{dir}/*\""))
        .collect::<Vec<_>>()
        .join(" ");
    let command = format!("find . -type f -name \"{glob}\" {excludes}");
    match limit {
        Some(limit) => format!("{command} | head -n {limit}"),
        None => command,
    }
}

fn rewrite_without_rg(command: &str) -> String {
    let mut rewritten = command.to_string();
    if let Some(found) = RG_FILES.find(&rewritten) {
        let glob = RG_INCLUDE_GLOB
            .captures(found.as_str())
            .map(|caps| caps[1].to_string())
            .unwrap_or_else(|| "*".to_string());
        rewritten = format!(
            "{}{}{}",
            &rewritten[..found.start()],
            build_find_command(&glob, None),
            &rewritten[found.end()..]
        );
    }
    RG_SEARCH
        .replace_all(&rewritten, r#"grep -E "$1""#)
        .into_owned()
}
