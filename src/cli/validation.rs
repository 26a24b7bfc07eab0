use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::cli::parse::InfileSpec;
use crate::job::Job;

/// Reads the given infiles from disk into the job.
pub fn attach_infiles(job: &mut Job, specs: &[InfileSpec], cache: bool) -> Result<()> {
    for spec in specs {
        validate_file_name(&spec.name)?;
        let attr = fs::metadata(&spec.path).with_context(|| format!("Cannot read {}", spec.path.display()))?;
        if attr.is_dir() {
            return Err(anyhow!("{} is a directory, only files can be shipped", spec.path.display()));
        }
        job.add_infile(spec.name.clone(), fs::read(&spec.path)?, cache);
    }
    Ok(())
}

/// Job file names must stay inside the job's working directory.
pub fn validate_file_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(anyhow!("{:?} is not a plain file name", name)),
    }
}

/// Where a retrieved outfile is written; refuses to overwrite.
pub fn output_path(dir: &Path, name: &str) -> Result<PathBuf> {
    validate_file_name(name)?;
    let attr = fs::metadata(dir).with_context(|| format!("Output directory {} does not exist", dir.display()))?;
    if !attr.is_dir() {
        return Err(anyhow!("{} is not a directory", dir.display()));
    }

    let path = dir.join(name);
    match fs::metadata(&path) {
        Ok(_) => Err(anyhow!("Output file {} already exists", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(path),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_plain_names() {
        assert!(validate_file_name("out.csv").is_ok());
        assert!(validate_file_name("../out.csv").is_err());
        assert!(validate_file_name("/etc/passwd").is_err());
        assert!(validate_file_name("a/b").is_err());
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("..").is_err());
    }

    #[test]
    fn infiles_are_read_and_dirs_refused() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scen.json");
        fs::write(&file, "{}").unwrap();

        let mut job = Job::new(["cycdriver"]);
        let spec = InfileSpec {
            name: "input.json".into(),
            path: file,
        };
        attach_infiles(&mut job, &[spec], true).unwrap();
        assert_eq!(job.infiles[0].name, "input.json");
        assert_eq!(job.infiles[0].data.as_deref(), Some(&b"{}"[..]));
        assert!(job.infiles[0].cache);

        let spec = InfileSpec {
            name: "d".into(),
            path: dir.path().to_path_buf(),
        };
        assert!(attach_infiles(&mut job, &[spec], false).is_err());
    }

    #[test]
    fn existing_outputs_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(output_path(dir.path(), "obj.out").unwrap(), dir.path().join("obj.out"));
        fs::write(dir.path().join("obj.out"), "").unwrap();
        assert!(output_path(dir.path(), "obj.out").is_err());
        assert!(output_path(&dir.path().join("missing"), "obj.out").is_err());
    }
}
