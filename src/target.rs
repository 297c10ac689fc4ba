//! Salted output targets.
//!
//! A task declares where its result goes with a path template. Resolving the
//! template against the task's salted version yields a [`Target`], a concrete
//! path whose existence is the only signal that the work was already done.
//!
//! Template syntax:
//!
//! * `{salt}` is the salted version truncated to the configured length,
//! * `{salt:N}` truncates to `N` hex characters instead (`1..=64`),
//! * `{name}` is a variable given on the [`TargetSpec`], else the task
//!   parameter `name`, else one of the builtins `{kind}` and `{version}`,
//! * `{{` and `}}` are literal braces.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::config::Settings;
use crate::error::{BuildError, TargetError};
use crate::fingerprint::{Fingerprint, HEX_LEN, salted_version_with};
use crate::param::Params;
use crate::task::{Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Lit(String),
    Salt(Option<usize>),
    Var(String),
}

/// A parsed path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    parts: Vec<Part>,
}

impl PathTemplate {
    pub fn parse(source: &str) -> Result<Self, TargetError> {
        let mut parts = Vec::new();
        let mut lit = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((offset, c)) = chars.next() {
            match c {
                '{' if chars.next_if(|&(_, c)| c == '{').is_some() => lit.push('{'),
                '}' if chars.next_if(|&(_, c)| c == '}').is_some() => lit.push('}'),
                '}' => {
                    return Err(TargetError::Unmatched {
                        template: source.to_string(),
                        offset,
                    });
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;

                    for (_, c) in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => break,
                            c => name.push(c),
                        }
                    }

                    if !closed {
                        return Err(TargetError::Unclosed {
                            template: source.to_string(),
                            offset,
                        });
                    }

                    if !lit.is_empty() {
                        parts.push(Part::Lit(std::mem::take(&mut lit)));
                    }

                    parts.push(Self::placeholder(source, offset, name.trim())?);
                }
                c => lit.push(c),
            }
        }

        if !lit.is_empty() {
            parts.push(Part::Lit(lit));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    fn placeholder(source: &str, offset: usize, name: &str) -> Result<Part, TargetError> {
        if name.is_empty() {
            return Err(TargetError::Empty {
                template: source.to_string(),
                offset,
            });
        }

        if name == "salt" {
            return Ok(Part::Salt(None));
        }

        if let Some(len) = name.strip_prefix("salt:") {
            return match len.trim().parse() {
                Ok(n) if (1..=HEX_LEN).contains(&n) => Ok(Part::Salt(Some(n))),
                _ => Err(TargetError::SaltLength(len.to_string())),
            };
        }

        Ok(Part::Var(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Names of the non-salt placeholders, in order of appearance.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            Part::Var(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Fills the template. `lookup` returns `Ok(None)` for unknown names.
    pub fn render<F>(
        &self,
        fingerprint: Fingerprint,
        salt_len: usize,
        mut lookup: F,
    ) -> Result<String, TargetError>
    where
        F: FnMut(&str) -> Result<Option<String>, TargetError>,
    {
        let mut out = String::with_capacity(self.source.len() + salt_len);

        for part in &self.parts {
            match part {
                Part::Lit(text) => out.push_str(text),
                Part::Salt(len) => out.push_str(&fingerprint.salt(len.unwrap_or(salt_len))),
                Part::Var(name) => match lookup(name)? {
                    Some(value) => out.push_str(&value),
                    None => {
                        return Err(TargetError::Unknown {
                            template: self.source.clone(),
                            name: name.clone(),
                        });
                    }
                },
            }
        }

        Ok(out)
    }
}

impl std::str::FromStr for PathTemplate {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Output declaration of a task: a path template plus optional overrides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetSpec {
    template: String,
    vars: BTreeMap<String, String>,
    salt_len: Option<usize>,
}

impl TargetSpec {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            vars: BTreeMap::new(),
            salt_len: None,
        }
    }

    /// Sets a template variable. Variables take precedence over task
    /// parameters of the same name.
    pub fn var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Overrides the configured salt length for `{salt}`.
    pub fn salt_len(mut self, salt_len: usize) -> Self {
        self.salt_len = Some(salt_len);
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Path text of the task parameters this spec substitutes into the path.
    ///
    /// Instances that agree on everything else but differ here write to
    /// different targets, even when the parameters are insignificant.
    pub(crate) fn partition(&self, params: &Params) -> Vec<(String, String)> {
        // a broken template is reported when the target is resolved
        let Ok(template) = PathTemplate::parse(&self.template) else {
            return Vec::new();
        };

        template
            .variables()
            .filter(|name| !self.vars.contains_key(*name))
            .filter_map(|name| {
                let value = params.get(name)?;
                let text = value.path_segment().unwrap_or_default();
                Some((name.to_string(), text))
            })
            .collect()
    }
}

/// A resolved output location.
///
/// The path embeds a short salt, the full salted version is kept alongside
/// for disambiguation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    path: Utf8PathBuf,
    fingerprint: Fingerprint,
    salt: String,
}

impl Target {
    pub fn new(path: impl Into<Utf8PathBuf>, fingerprint: Fingerprint, salt_len: usize) -> Self {
        Self {
            path: path.into(),
            fingerprint,
            salt: fingerprint.salt(salt_len),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn salt(&self) -> &str {
        &self.salt
    }

    /// Whether the artifact was already produced.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    pub fn read_to_string(&self) -> io::Result<String> {
        fs::read_to_string(&self.path)
    }

    /// Starts an atomic write. Nothing becomes visible at the target path
    /// until [`AtomicFile::commit`] is called.
    pub fn create(&self) -> io::Result<AtomicFile> {
        AtomicFile::new(&self.path)
    }

    /// Writes the target through `write`, committing only if it succeeds.
    pub fn write_with<F, E>(&self, write: F) -> Result<(), E>
    where
        F: FnOnce(&mut AtomicFile) -> Result<(), E>,
        E: From<io::Error>,
    {
        let mut file = self.create()?;
        write(&mut file)?;
        file.commit()?;
        Ok(())
    }
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A file written next to its destination and renamed into place on commit.
/// Dropping it without a successful commit removes the partial file.
#[derive(Debug)]
pub struct AtomicFile {
    file: Option<File>,
    temp: Utf8PathBuf,
    dest: Utf8PathBuf,
    committed: bool,
}

impl AtomicFile {
    fn new(dest: &Utf8Path) -> io::Result<Self> {
        let name = dest
            .file_name()
            .ok_or_else(|| io::Error::other(format!("'{dest}' has no file name")))?;

        let parent = dest.parent().filter(|p| !p.as_str().is_empty());
        if let Some(parent) = parent {
            fs::create_dir_all(parent)?;
        }

        let temp = format!(
            ".{name}.{}-{}.tmp",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let temp = match parent {
            Some(parent) => parent.join(temp),
            None => Utf8PathBuf::from(temp),
        };

        let file = File::create(&temp)?;

        Ok(Self {
            file: Some(file),
            temp,
            dest: dest.to_owned(),
            committed: false,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.dest
    }

    pub fn commit(mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        fs::rename(&self.temp, &self.dest)?;
        self.committed = true;
        Ok(())
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("file already closed"))
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        // close before removing
        self.file.take();
        if !self.committed {
            let _ = fs::remove_file(&self.temp);
        }
    }
}

/// Resolves `spec` for `task`, given the task's salted version.
///
/// Pure: nothing is created on disk.
pub fn resolve(
    task: &dyn Task,
    fingerprint: Fingerprint,
    spec: &TargetSpec,
    settings: &Settings,
) -> Result<Target, TargetError> {
    let template = PathTemplate::parse(&spec.template)?;

    let salt_len = spec.salt_len.unwrap_or(settings.salt_len);
    if !(1..=HEX_LEN).contains(&salt_len) {
        return Err(TargetError::SaltLength(salt_len.to_string()));
    }

    let params = task.params();
    let rendered = template.render(fingerprint, salt_len, |name| {
        if let Some(value) = spec.vars.get(name) {
            return Ok(Some(value.clone()));
        }

        if let Some(value) = params.get(name) {
            return value
                .path_segment()
                .map(Some)
                .map_err(|source| TargetError::Param {
                    name: name.to_string(),
                    source,
                });
        }

        Ok(match name {
            "kind" => Some(task.kind().to_string()),
            "version" => Some(task.code_version().to_string()),
            _ => None,
        })
    })?;

    if rendered.trim().is_empty() {
        return Err(TargetError::EmptyPath(spec.template.clone()));
    }

    let path = Utf8PathBuf::from(rendered);
    let path = if path.is_relative() {
        settings.root.join(path)
    } else {
        path
    };

    Ok(Target::new(path, fingerprint, salt_len))
}

/// Computes the salted version of `task` and resolves its declared output.
///
/// Returns `Ok(None)` for tasks that don't declare one.
pub fn salted_target(
    task: &Arc<dyn Task>,
    settings: &Settings,
) -> Result<Option<Target>, BuildError> {
    let Some(spec) = task.output() else {
        return Ok(None);
    };

    let id = TaskId::of(task.as_ref())?;
    let fingerprint = salted_version_with(task.clone(), settings.algorithm)?;
    let target =
        resolve(task.as_ref(), fingerprint, &spec, settings).map_err(|e| BuildError::Target(id, e))?;

    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::fingerprint::Algorithm;
    use crate::task::Descriptor;

    fn fp() -> Fingerprint {
        Algorithm::Sha256.digest(b"abc")
    }

    fn render(template: &str) -> Result<String, TargetError> {
        PathTemplate::parse(template)?.render(fp(), 6, |name| {
            Ok(match name {
                "date" => Some("2018-03-01".to_string()),
                _ => None,
            })
        })
    }

    fn settings(root: &str) -> Settings {
        Settings::default().root(root)
    }

    #[test]
    fn placeholders() {
        assert_eq!(render("data/{date}-{salt}.tsv").unwrap(), "data/2018-03-01-ba7816.tsv");
        assert_eq!(render("{salt:2}/{salt:10}").unwrap(), "ba/ba7816bf8f");
        assert_eq!(render("{{literal}}/{ date }").unwrap(), "{literal}/2018-03-01");
        assert_eq!(render("plain.txt").unwrap(), "plain.txt");
    }

    #[test]
    fn variables_listed_in_order() {
        let template = PathTemplate::parse("{a}/{salt}/{b}/{{c}}").unwrap();
        assert_eq!(template.variables().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(template.as_str(), "{a}/{salt}/{b}/{{c}}");
    }

    #[test]
    fn malformed_templates() {
        assert!(matches!(
            render("data/{salt"),
            Err(TargetError::Unclosed { offset: 5, .. })
        ));
        assert!(matches!(
            render("data/{a{salt}"),
            Err(TargetError::Unclosed { offset: 5, .. })
        ));
        assert!(matches!(
            render("data}"),
            Err(TargetError::Unmatched { offset: 4, .. })
        ));
        assert!(matches!(render("a/{}"), Err(TargetError::Empty { offset: 2, .. })));
        assert!(matches!(render("{salt:0}"), Err(TargetError::SaltLength(_))));
        assert!(matches!(render("{salt:65}"), Err(TargetError::SaltLength(_))));
        assert!(matches!(render("{salt:x}"), Err(TargetError::SaltLength(_))));
        assert_eq!(
            render("{nope}"),
            Err(TargetError::Unknown {
                template: "{nope}".to_string(),
                name: "nope".to_string()
            })
        );
    }

    #[test]
    fn resolve_from_params_and_builtins() {
        let date = NaiveDate::from_ymd_opt(2018, 3, 1).unwrap();
        let task = Descriptor::new("Stream", "1.0").significant("date", date);
        let spec = TargetSpec::new("{kind}/v{version}/{date}-{salt}.tsv");

        let target = resolve(&task, fp(), &spec, &settings("out")).unwrap();
        assert_eq!(target.path().as_str(), "out/Stream/v1.0/2018-03-01-ba7816.tsv");
        assert_eq!(target.salt(), "ba7816");
        assert_eq!(target.fingerprint(), fp());
    }

    #[test]
    fn vars_shadow_params() {
        let task = Descriptor::new("Stream", "1.0").significant("date", "2018-03-01");
        let spec = TargetSpec::new("/abs/{date}_{salt}").var("date", "today").salt_len(3);

        let target = resolve(&task, fp(), &spec, &settings("ignored")).unwrap();
        assert_eq!(target.path().as_str(), "/abs/today_ba7");
    }

    #[test]
    fn resolve_rejects_bad_salt_len_and_empty_path() {
        let task = Descriptor::new("T", "1").significant("name", "");
        assert!(matches!(
            resolve(&task, fp(), &TargetSpec::new("{salt}").salt_len(0), &settings(".")),
            Err(TargetError::SaltLength(_))
        ));
        assert!(matches!(
            resolve(&task, fp(), &TargetSpec::new("{name}"), &settings(".")),
            Err(TargetError::EmptyPath(_))
        ));
    }

    #[test]
    fn resolve_unrenderable_param() {
        let task = Descriptor::new("T", "1").insignificant("x", f64::NAN);
        assert!(matches!(
            resolve(&task, fp(), &TargetSpec::new("{x}"), &settings(".")),
            Err(TargetError::Param { .. })
        ));
    }

    #[test]
    fn salted_target_uses_salted_version() {
        let task = Descriptor::new("Top", "1")
            .output(TargetSpec::new("{kind}-{salt:64}"))
            .shared();
        let target = salted_target(&task, &settings("/data")).unwrap().unwrap();

        let expected = Algorithm::Sha256.digest(b"Top,1");
        assert_eq!(target.path().as_str(), format!("/data/Top-{expected}"));

        let no_output = Descriptor::new("Top", "1").shared();
        assert!(salted_target(&no_output, &settings(".")).unwrap().is_none());
    }

    #[test]
    fn write_with_commits() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let target = Target::new(root.join("nested/out.txt"), fp(), 6);

        assert!(!target.exists());
        target
            .write_with(|file| -> io::Result<()> { file.write_all(b"hello") })
            .unwrap();
        assert!(target.exists());

        let mut text = String::new();
        target.open().unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn failed_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let target = Target::new(root.join("out.txt"), fp(), 6);

        let result = target.write_with(|file| -> anyhow::Result<()> {
            file.write_all(b"partial")?;
            anyhow::bail!("boom")
        });

        assert!(result.is_err());
        assert!(!target.exists());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn failed_commit_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let dest = root.join("out.txt");
        // a non-empty directory can't be replaced by a file
        fs::create_dir_all(dest.join("occupied")).unwrap();

        let target = Target::new(dest.clone(), fp(), 6);
        let result = target.write_with(|file| -> io::Result<()> { file.write_all(b"data") });
        assert!(result.is_err());

        let names: Vec<_> = fs::read_dir(&root)
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("out.txt")]);
        assert!(dest.is_dir());
    }

    #[test]
    fn partition_tracks_parameters_in_the_path() {
        let params = Params::new()
            .significant("date", "2018-03-01")
            .insignificant("day", 3)
            .insignificant("workers", 4);

        let spec = TargetSpec::new("{kind}/{day}-{date}-{salt}");
        assert_eq!(
            spec.partition(&params),
            vec![
                ("day".to_string(), "3".to_string()),
                ("date".to_string(), "2018-03-01".to_string())
            ]
        );

        let overridden = spec.clone().var("day", "fixed");
        assert_eq!(
            overridden.partition(&params),
            vec![("date".to_string(), "2018-03-01".to_string())]
        );
        assert!(TargetSpec::new("{broken").partition(&params).is_empty());
    }

    #[test]
    fn dropped_guard_discards() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let target = Target::new(root.join("out.txt"), fp(), 6);

        {
            let mut file = target.create().unwrap();
            file.write_all(b"partial").unwrap();
            assert!(!target.exists());
        }

        assert!(!target.exists());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }
}
