//! Parsing helpers for `/proc/self/mountinfo` (and similar mountinfo files).

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    /// `major:minor` of the mounted filesystem, as printed by the kernel.
    pub major_minor: String,
    pub source: String,
}

pub fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<MountInfo> {
    // mountinfo format:
    //   <id> <parent> <major:minor> <root> <mount point> <opts> [optional...] - <fstype> <source> <superopts>
    let (pre, post) = line.split_once(" - ")?;
    let mut pre_fields = pre.split_whitespace();
    let _mount_id = pre_fields.next()?;
    let _parent_id = pre_fields.next()?;
    let major_minor = pre_fields.next()?;
    let _root = pre_fields.next()?;
    let _mount_point = pre_fields.next()?;

    let mut post_fields = post.split_whitespace();
    let _fstype = post_fields.next()?;
    let source = unescape_mount_path(post_fields.next()?);

    Some(MountInfo {
        major_minor: major_minor.to_string(),
        source,
    })
}

/// Mount sources of every entry whose device is `major_minor` (e.g. `"8:3"`).
///
/// Bind mounts repeat the same source, so the result is deduplicated.
pub fn sources_for_device(content: &str, major_minor: &str) -> Vec<String> {
    let mut sources: Vec<String> = parse_mountinfo(content)
        .into_iter()
        .filter(|entry| entry.major_minor == major_minor)
        .map(|entry| entry.source)
        .collect();
    sources.sort();
    sources.dedup();
    sources
}

pub fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}
