//! Git output parsing helpers.

use std::process::Output;

/// Formats a git error with both stdout and stderr.
pub fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

/// True for a full 40 (SHA-1) or 64 (SHA-256) character hex object id.
pub fn is_commit_id(reference: &str) -> bool {
    matches!(reference.len(), 40 | 64) && reference.chars().all(|c| c.is_ascii_hexdigit())
}

/// Picks the commit for `reference` from `git ls-remote` output.
///
/// Prefers the peeled `^{}` entry of an annotated tag, then an exact ref
/// match, then `refs/heads/<ref>` and `refs/tags/<ref>`.
pub fn parse_ls_remote(output: &str, reference: &str) -> Option<String> {
    let entries: Vec<(&str, &str)> = output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some((parts.next()?, parts.next()?))
        })
        .collect();

    let candidates = [
        format!("refs/tags/{}^{{}}", reference),
        reference.to_string(),
        format!("refs/heads/{}", reference),
        format!("refs/tags/{}", reference),
    ];

    candidates.iter().find_map(|wanted| {
        entries
            .iter()
            .find(|(_, name)| *name == wanted.as_str())
            .map(|(sha, _)| sha.to_string())
    })
}

/// Splits `git ls-tree --name-only -z` output.
pub fn parse_ls_tree(output: &[u8]) -> Vec<String> {
    output
        .split(|b| *b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| String::from_utf8_lossy(entry).into_owned())
        .collect()
}
