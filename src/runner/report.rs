use std::fmt::{self, Display, Write};
use std::time::Duration;

use console::Style;
use serde::{Serialize, Serializer};

use crate::fingerprint::Fingerprint;
use crate::target::Target;
use crate::task::TaskId;

/// What happened to a task during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    /// The target already existed.
    Cached,
    /// Not needed, every path to it goes through a cached task.
    Pruned,
    /// Would run, reported by [`Runner::dry_run`](super::Runner::dry_run).
    Pending,
    Executed {
        #[serde(rename = "millis", serialize_with = "as_millis")]
        duration: Duration,
    },
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_nanos() as f64 / 1e6)
}

#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    /// Position in the graph, stable within one report.
    pub index: usize,
    pub id: TaskId,
    pub fingerprint: Fingerprint,
    pub target: Option<Target>,
    pub dependencies: Vec<usize>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Per-task results of a run, in topological order.
#[derive(Debug, Default, Serialize)]
pub struct Report {
    entries: Vec<Entry>,
}

const ANSI_BLUE: Style = Style::new().blue();
const ANSI_GREEN: Style = Style::new().green();
const ANSI_DIM: Style = Style::new().dim();

impl Report {
    pub(crate) fn new(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// First entry with identity `id`.
    pub fn get(&self, id: &TaskId) -> Option<&Entry> {
        self.entries.iter().find(|entry| &entry.id == id)
    }

    pub fn outcome(&self, id: &TaskId) -> Option<Outcome> {
        self.get(id).map(|entry| entry.outcome)
    }

    pub fn executed(&self) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.outcome, Outcome::Executed { .. }))
    }

    pub fn cached(&self) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(|entry| entry.outcome == Outcome::Cached)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the run as a Mermaid diagram, color-coded by outcome.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Cached
    /// * **Grey**: Pruned or pending
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = self.write_mermaid(&mut f);
        f
    }

    fn write_mermaid(&self, f: &mut String) -> fmt::Result {
        writeln!(f, "graph LR")?;

        let times: Vec<f64> = self
            .executed()
            .filter_map(|entry| match entry.outcome {
                Outcome::Executed { duration } => Some(duration.as_secs_f64()),
                _ => None,
            })
            .collect();

        let min_time = times.iter().copied().fold(f64::MAX, f64::min);
        let mut max_time = times.iter().copied().fold(f64::MIN, f64::max);

        // Avoid divide by zero if all tasks took same time
        if times.is_empty() || (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for entry in &self.entries {
            let name = entry.id.as_str().replace('"', "#quot;");

            let (label, color) = match entry.outcome {
                Outcome::Executed { duration } => {
                    let t = (duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{duration:.2?}"), heat(t))
                }
                Outcome::Cached => ("Cached".to_string(), "#ADD8E6".to_string()),
                Outcome::Pruned => ("Pruned".to_string(), "#D3D3D3".to_string()),
                Outcome::Pending => ("Pending".to_string(), "#D3D3D3".to_string()),
            };

            let salt = entry
                .target
                .as_ref()
                .map_or_else(|| entry.fingerprint.salt(6), |t| t.salt().to_string());

            writeln!(f, "    {}[\"{}\\n{} {}\"]", entry.index, name, salt, label)?;
            writeln!(f, "    style {} fill:{}", entry.index, color)?;
        }

        for entry in &self.entries {
            for dependency in &entry.dependencies {
                writeln!(f, "    {} --> {}", dependency, entry.index)?;
            }
        }

        Ok(())
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g, b) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255, 0)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8, 0)
    };
    format!("#{r:02X}{g:02X}{b:02X}")
}

/// One line per task, for terminals.
impl Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            let path = entry
                .target
                .as_ref()
                .map(|t| t.path().as_str())
                .unwrap_or("-");

            match entry.outcome {
                Outcome::Executed { duration } => writeln!(
                    f,
                    "{} {} {} {}",
                    ANSI_GREEN.apply_to("ran   "),
                    entry.id,
                    path,
                    ANSI_DIM.apply_to(format!("({duration:.2?})"))
                )?,
                Outcome::Cached => {
                    writeln!(f, "{} {} {}", ANSI_BLUE.apply_to("cached"), entry.id, path)?
                }
                Outcome::Pending => writeln!(f, "todo   {} {}", entry.id, path)?,
                Outcome::Pruned => {
                    writeln!(f, "{} {}", ANSI_DIM.apply_to("pruned"), ANSI_DIM.apply_to(&entry.id))?
                }
            }
        }

        Ok(())
    }
}
