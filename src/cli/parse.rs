use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

/// Parses durations like `500ms`, `30s`, `5m`, `2h`. A bare number is seconds.
pub fn parse_duration(arg: &str) -> Result<Duration> {
    let arg = arg.trim();
    let split = arg.find(|c: char| !c.is_ascii_digit()).unwrap_or(arg.len());
    let (value, unit) = arg.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| anyhow!("Invalid duration {:?}, expected e.g. 30s", arg))?;

    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => return Err(anyhow!("Unknown duration unit {:?} in {:?}", other, arg)),
    };
    Ok(duration)
}

/// An infile given on the command line as `NAME=PATH` or just `PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfileSpec {
    /// Name the file gets inside the job's working directory.
    pub name: String,
    pub path: PathBuf,
}

pub fn parse_infile(arg: &str) -> Result<InfileSpec> {
    if let Some((name, path)) = arg.split_once('=') {
        if name.is_empty() || path.is_empty() {
            return Err(anyhow!("Expected NAME=PATH, got {:?}", arg));
        }
        return Ok(InfileSpec {
            name: name.to_string(),
            path: path.into(),
        });
    }

    let path = PathBuf::from(arg);
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(anyhow!("Cannot derive a file name from {:?}", arg))?
        .to_string();
    Ok(InfileSpec { name, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn infile_names() {
        let spec = parse_infile("scen.json=/tmp/run/scenario-3.json").unwrap();
        assert_eq!(spec.name, "scen.json");
        assert_eq!(spec.path, PathBuf::from("/tmp/run/scenario-3.json"));

        let spec = parse_infile("inputs/tmpl.xml").unwrap();
        assert_eq!(spec.name, "tmpl.xml");
        assert_eq!(spec.path, PathBuf::from("inputs/tmpl.xml"));

        assert!(parse_infile("=x").is_err());
        assert!(parse_infile("..").is_err());
    }
}
