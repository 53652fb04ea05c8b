//! The `ipset` tool adapter
//!
//! Creates and reconciles hash:net sets, adds and deletes entries with
//! optional comments and timeouts, lists entries together with their
//! comments, and performs atomic bulk updates through a temporary set and
//! `swap`.
//!
//! Reconciliation: when an ensured set already exists but its creation line
//! lacks the requested timeout or comment capability, the adapter saves the
//! current entries, creates a temporary set with the desired options, replays
//! the entries into it (stripping timeout clauses when the target has no
//! timeout), swaps and destroys the temporary. The swap is the only atomic
//! point.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use super::runner::{command_line, output_text, CommandRunner};
use super::IpFamily;
use crate::error::IpsetError;

/// Minimum supported ipset version
pub const MIN_IPSET_VERSION: &str = "6.0";

/// Default entry timeout: none, entries live forever
pub const DEFAULT_SET_TIMEOUT: u32 = 0;

const IPSET: &str = "ipset";

/// Options a set is created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOptions {
    /// Address family
    pub family: IpFamily,
    /// Initial hash size
    pub hash_size: u32,
    /// Maximum number of elements
    pub max_elem: u32,
    /// Default entry timeout in seconds; 0 disables timeouts
    pub timeout: u32,
    /// Enable per-entry comments
    pub comments: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            family: IpFamily::V4,
            hash_size: 1024,
            max_elem: 65536,
            timeout: DEFAULT_SET_TIMEOUT,
            comments: false,
        }
    }
}

impl SetOptions {
    /// Options for the dynamic sets the observer feeds: comments on
    #[must_use]
    pub fn dynamic(family: IpFamily) -> Self {
        Self {
            family,
            comments: true,
            ..Self::default()
        }
    }
}

/// One set entry together with its comment, as reported by `ipset save`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetEntry {
    /// Address or network
    pub entry: String,
    /// Attached comment, if any
    pub comment: Option<String>,
}

/// Handle to a kernel set of type hash:net
///
/// Cheap to clone; all state lives in the kernel.
#[derive(Clone)]
pub struct Ipset {
    name: String,
    opts: SetOptions,
    runner: Arc<dyn CommandRunner>,
}

/// Verify that the ipset tool is available and recent enough
///
/// # Errors
///
/// `IpsetError::ToolMissing` when the binary cannot be run,
/// `IpsetError::UnsupportedVersion` when it reports a version below 6.0.
/// A version string that cannot be parsed is logged and assumed supported.
pub async fn check_tool(runner: &Arc<dyn CommandRunner>) -> Result<(), IpsetError> {
    let output = runner
        .run(IPSET, &["--version"])
        .await
        .map_err(|_| IpsetError::ToolMissing)?;
    if !output.status.success() {
        return Err(IpsetError::ToolMissing);
    }
    let text = output_text(&output);
    match parse_version(&text) {
        Some(found) => {
            if compare_versions(&found, MIN_IPSET_VERSION) < 0 {
                return Err(IpsetError::UnsupportedVersion {
                    minimum: MIN_IPSET_VERSION.into(),
                    found,
                });
            }
            Ok(())
        }
        None => {
            warn!("failed to detect ipset version, assuming supported: {text}");
            Ok(())
        }
    }
}

impl Ipset {
    /// Create the set if absent, or reconcile its options if present
    ///
    /// # Errors
    ///
    /// Tool failures carry the invoking command line and its output.
    pub async fn ensure(
        runner: Arc<dyn CommandRunner>,
        name: impl Into<String>,
        opts: SetOptions,
    ) -> Result<Self, IpsetError> {
        let set = Self {
            name: name.into(),
            opts,
            runner,
        };
        set.create_or_reconcile(&set.name.clone()).await?;
        Ok(set)
    }

    /// Set name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an entry, optionally with a per-entry timeout
    pub async fn add(&self, entry: &str, timeout: u32) -> Result<(), IpsetError> {
        let timeout_str = timeout.to_string();
        let mut args = vec!["add", self.name.as_str(), entry];
        if timeout > 0 {
            args.push("timeout");
            args.push(&timeout_str);
        }
        args.push("-exist");
        self.run_checked(&args).await
    }

    /// Add an entry carrying a comment
    pub async fn add_with_comment(
        &self,
        entry: &str,
        comment: &str,
        timeout: u32,
    ) -> Result<(), IpsetError> {
        let timeout_str = timeout.to_string();
        let mut args = vec!["add", self.name.as_str(), entry];
        if timeout > 0 {
            args.push("timeout");
            args.push(&timeout_str);
        }
        args.push("comment");
        args.push(comment);
        args.push("-exist");
        self.run_checked(&args).await
    }

    /// Delete an entry; absent entries are not an error
    pub async fn del(&self, entry: &str) -> Result<(), IpsetError> {
        self.run_checked(&["del", self.name.as_str(), entry, "-exist"]).await
    }

    /// Remove every entry
    pub async fn flush(&self) -> Result<(), IpsetError> {
        self.run_checked(&["flush", self.name.as_str()]).await
    }

    /// Destroy the set
    pub async fn destroy(&self) -> Result<(), IpsetError> {
        destroy(&self.runner, &self.name).await
    }

    /// Replace the whole contents atomically
    ///
    /// Creates a temporary set with the same options, inserts all entries,
    /// swaps names and destroys the temporary. Readers may observe doubled
    /// membership for the instant of the swap, never an empty set.
    pub async fn refresh(&self, entries: &[String]) -> Result<(), IpsetError> {
        let temp = format!("{}-temp", self.name);
        self.create_or_reconcile(&temp).await?;

        for entry in entries {
            let args = ["add", temp.as_str(), entry.as_str(), "-exist"];
            let output = self.runner.run(IPSET, &args).await?;
            if !output.status.success() {
                warn!(
                    "failed to add {} to {}: {}",
                    entry,
                    temp,
                    output_text(&output)
                );
            }
        }

        swap(&self.runner, &temp, &self.name).await?;
        destroy(&self.runner, &temp).await
    }

    /// List entries together with their comments via `ipset save`
    pub async fn list_with_comments(&self) -> Result<Vec<SetEntry>, IpsetError> {
        list_entries_with_comments(&self.runner, &self.name).await
    }

    async fn exists(&self, name: &str) -> Result<bool, IpsetError> {
        let output = self.runner.run(IPSET, &["-q", "list", name]).await?;
        Ok(output.status.success())
    }

    fn create_or_reconcile<'a>(
        &'a self,
        name: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), IpsetError>> + Send + 'a>>
    {
        Box::pin(async move {
            if !self.exists(name).await? {
                return self.create(name).await;
            }
            self.reconcile(name).await
        })
    }

    async fn create(&self, name: &str) -> Result<(), IpsetError> {
        let hash_size = self.opts.hash_size.to_string();
        let max_elem = self.opts.max_elem.to_string();
        let timeout = self.opts.timeout.to_string();

        let mut args: Vec<&str> = vec![
            "-exist",
            "create",
            name,
            "hash:net",
            "family",
            self.opts.family.as_ipset_arg(),
            "hashsize",
            &hash_size,
            "maxelem",
            &max_elem,
        ];
        if self.opts.timeout > 0 {
            args.push("timeout");
            args.push(&timeout);
        }
        if self.opts.comments {
            args.push("comment");
        }
        self.run_checked(&args).await
    }

    /// Inspect an existing set's creation line; recreate through a temporary
    /// set when the requested timeout or comment capability is missing.
    async fn reconcile(&self, name: &str) -> Result<(), IpsetError> {
        if self.opts.timeout == 0 && !self.opts.comments {
            return Ok(());
        }

        let save = self.save(name).await?;
        let Some(create_line) = find_create_line(&save, name) else {
            return Ok(());
        };

        let timeout_value = parse_timeout_value(&create_line);
        let has_comment = create_line.contains(" comment");

        let mut need_recreate = false;
        if self.opts.timeout > 0 {
            if timeout_value != Some(self.opts.timeout) {
                need_recreate = true;
            }
        } else if timeout_value.is_some_and(|t| t > 0) {
            need_recreate = true;
        }
        if self.opts.comments && !has_comment {
            need_recreate = true;
        }
        if !need_recreate {
            return Ok(());
        }

        warn!("ipset {name} missing required options; recreating");

        let mut entries = extract_add_lines(&save, name);
        if self.opts.timeout == 0 {
            for line in &mut entries {
                *line = strip_timeout_option(line);
            }
        }
        self.recreate_with_swap(name, &entries).await
    }

    async fn recreate_with_swap(&self, name: &str, entries: &[String]) -> Result<(), IpsetError> {
        let temp = format!("{name}-tmp");
        self.create_or_reconcile(&temp).await?;

        if !entries.is_empty() {
            let mut script = String::new();
            for line in entries {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                script.push_str(&replace_add_set_name(line, name, &temp));
                script.push('\n');
            }
            let output = self
                .runner
                .run_with_stdin(IPSET, &["restore"], script.as_bytes())
                .await?;
            if !output.status.success() {
                return Err(IpsetError::tool(
                    format!("restore into {temp}"),
                    output_text(&output),
                ));
            }
        }

        swap(&self.runner, &temp, name).await?;
        if let Err(e) = destroy(&self.runner, &temp).await {
            warn!("failed to destroy temp ipset {temp}: {e}");
        }
        Ok(())
    }

    async fn save(&self, name: &str) -> Result<String, IpsetError> {
        let output = self.runner.run(IPSET, &["save", name]).await?;
        if !output.status.success() {
            return Err(IpsetError::tool(
                format!("save {name}"),
                output_text(&output),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_checked(&self, args: &[&str]) -> Result<(), IpsetError> {
        let output = self.runner.run(IPSET, args).await?;
        if !output.status.success() {
            return Err(IpsetError::tool(
                command_line(IPSET, args),
                output_text(&output),
            ));
        }
        Ok(())
    }
}

/// Atomically exchange the contents of two sets
pub async fn swap(
    runner: &Arc<dyn CommandRunner>,
    from: &str,
    to: &str,
) -> Result<(), IpsetError> {
    let output = runner.run(IPSET, &["swap", from, to]).await?;
    if !output.status.success() {
        return Err(IpsetError::tool(
            format!("swap {from} {to}"),
            output_text(&output),
        ));
    }
    Ok(())
}

/// Destroy a set by name
pub async fn destroy(runner: &Arc<dyn CommandRunner>, name: &str) -> Result<(), IpsetError> {
    let output = runner.run(IPSET, &["destroy", name]).await?;
    if !output.status.success() {
        return Err(IpsetError::tool(
            format!("destroy {name}"),
            output_text(&output),
        ));
    }
    Ok(())
}

/// List a set's entries with comments; a missing set yields an empty list
pub async fn list_entries_with_comments(
    runner: &Arc<dyn CommandRunner>,
    name: &str,
) -> Result<Vec<SetEntry>, IpsetError> {
    let probe = runner.run(IPSET, &["-q", "list", name]).await?;
    if !probe.status.success() {
        return Ok(Vec::new());
    }
    let output = runner.run(IPSET, &["save", name]).await?;
    if !output.status.success() {
        return Err(IpsetError::tool(
            format!("save {name}"),
            output_text(&output),
        ));
    }
    let save = String::from_utf8_lossy(&output.stdout).into_owned();
    Ok(extract_entries_with_comments(&save, name))
}

/// Entries whose comment starts with the given prefix
pub async fn entries_by_comment_prefix(
    runner: &Arc<dyn CommandRunner>,
    name: &str,
    prefix: &str,
) -> Result<Vec<String>, IpsetError> {
    if prefix.is_empty() {
        return Ok(Vec::new());
    }
    let entries = list_entries_with_comments(runner, name).await?;
    Ok(entries
        .into_iter()
        .filter(|e| e.comment.as_deref().is_some_and(|c| c.starts_with(prefix)))
        .map(|e| e.entry)
        .collect())
}

/// Delete a list of entries, tolerating a missing set and logging failures
pub async fn remove_entries(
    runner: &Arc<dyn CommandRunner>,
    name: &str,
    entries: &[String],
) -> Result<(), IpsetError> {
    if entries.is_empty() {
        return Ok(());
    }
    let probe = runner.run(IPSET, &["-q", "list", name]).await?;
    if !probe.status.success() {
        return Ok(());
    }
    for entry in entries {
        let output = runner.run(IPSET, &["del", name, entry]).await?;
        if !output.status.success() {
            warn!(
                "failed to delete {} from {}: {}",
                entry,
                name,
                output_text(&output)
            );
        }
    }
    Ok(())
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"v(\d+\.\d+)").unwrap())
}

fn parse_version(text: &str) -> Option<String> {
    version_regex()
        .captures(text)
        .map(|c| c[1].to_string())
}

/// Numeric dotted-version comparison: negative, zero or positive
fn compare_versions(a: &str, b: &str) -> i32 {
    let parts_a: Vec<u32> = a.split('.').filter_map(|p| p.parse().ok()).collect();
    let parts_b: Vec<u32> = b.split('.').filter_map(|p| p.parse().ok()).collect();
    for (x, y) in parts_a.iter().zip(parts_b.iter()) {
        if x != y {
            return if x > y { 1 } else { -1 };
        }
    }
    parts_a.len() as i32 - parts_b.len() as i32
}

fn find_create_line(save: &str, name: &str) -> Option<String> {
    save.lines()
        .filter(|line| line.starts_with("create "))
        .find(|line| line.split_whitespace().nth(1) == Some(name))
        .map(ToString::to_string)
}

fn extract_add_lines(save: &str, name: &str) -> Vec<String> {
    save.lines()
        .filter(|line| line.starts_with("add "))
        .filter(|line| line.split_whitespace().nth(1) == Some(name))
        .map(ToString::to_string)
        .collect()
}

fn strip_timeout_option(line: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\s+timeout\s+\d+").unwrap());
    re.replace_all(line, "").into_owned()
}

fn parse_timeout_value(line: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\stimeout\s+(\d+)").unwrap());
    re.captures(line).and_then(|c| c[1].parse().ok())
}

fn replace_add_set_name(line: &str, old: &str, new: &str) -> String {
    let prefix = format!("add {old} ");
    line.strip_prefix(&prefix)
        .map_or_else(|| line.to_string(), |rest| format!("add {new} {rest}"))
}

fn parse_comment_from_line(line: &str) -> Option<String> {
    let key = " comment ";
    let idx = line.find(key)?;
    let rest = &line[idx + key.len()..];
    if rest.is_empty() {
        return None;
    }
    if let Some(quoted) = rest.strip_prefix('"') {
        let comment = quoted
            .find('"')
            .map_or_else(|| quoted.trim().to_string(), |end| quoted[..end].to_string());
        return Some(comment);
    }
    rest.split_whitespace().next().map(ToString::to_string)
}

fn extract_entries_with_comments(save: &str, name: &str) -> Vec<SetEntry> {
    save.lines()
        .filter(|line| line.starts_with("add "))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            parts.next()?; // "add"
            if parts.next()? != name {
                return None;
            }
            let entry = parts.next()?.to_string();
            Some(SetEntry {
                entry,
                comment: parse_comment_from_line(line),
            })
        })
        .collect()
}
