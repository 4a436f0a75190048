use lazy_regex::regex_replace_all;
use std::path::PathBuf;
use std::str::{FromStr, SplitWhitespace};

pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// One line of /proc/self/mountinfo, reduced to what the executor needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub read_write: bool,
    pub fs_type: String,
    /// Mount source, usually the device node.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnexpectedFormat;

impl FromStr for MountInfo {
    type Err = UnexpectedFormat;
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        // layout per `man 5 proc`:
        // id parent major:minor root mount_point options [optional...] -
        // fs_type source super_options
        let mut tokens = line.split_whitespace();
        let tokens = &mut tokens;
        for _ in 0..4 {
            next(tokens)?;
        }
        let mount_point = PathBuf::from(unescape(next(tokens)?));
        let read_write = next(tokens)?.split(',').any(|option| option == "rw");
        skip_until(tokens, "-")?;
        let fs_type = next(tokens)?.to_string();
        let source = unescape(next(tokens)?);
        Ok(Self {
            mount_point,
            read_write,
            fs_type,
            source,
        })
    }
}

/// Decode the octal escapes the kernel writes for blanks and backslashes:
/// `/media/dys/USB\040DISK` is `/media/dys/USB DISK`.
fn unescape(s: &str) -> String {
    regex_replace_all!(r#"\\([0-7]{3})"#, s, |whole: &str, n: &str| {
        u8::from_str_radix(n, 8)
            .map(|b| (b as char).to_string())
            .unwrap_or_else(|_| whole.to_string())
    })
    .to_string()
}

fn next<'a>(split: &mut SplitWhitespace<'a>) -> Result<&'a str, UnexpectedFormat> {
    split.next().ok_or(UnexpectedFormat)
}

fn skip_until(split: &mut SplitWhitespace<'_>, sep: &'static str) -> Result<(), UnexpectedFormat> {
    loop {
        if next(split)? == sep {
            return Ok(());
        }
    }
}

/// Parse a whole mountinfo file. Malformed lines are skipped.
pub fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match line.parse::<MountInfo>() {
            Ok(info) => Some(info),
            Err(_) => {
                tracing::debug!("Skipping malformed mountinfo line: {}", line);
                None
            }
        })
        .collect()
}
