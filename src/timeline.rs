use crate::{ValidationError, FRAME_BUDGET};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// One of the three segments of an emotion animation, in playback order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Intro,
    Loop,
    Exit,
}

impl Phase {
    /// Fixed compile order: intro, then loop, then exit
    pub const ORDER: [Phase; 3] = [Phase::Intro, Phase::Loop, Phase::Exit];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Intro => "intro",
            Phase::Loop => "loop",
            Phase::Exit => "exit",
        };
        f.write_str(name)
    }
}

/// Presentation-time effect rendered by the firmware; carried through untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// A reference to one source-clip frame plus its actions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineFrame {
    pub source_frame_index: u32,
    #[serde(default)]
    pub actions: Vec<FrameAction>,
}

impl TimelineFrame {
    pub fn new(source_frame_index: u32) -> Self {
        Self { source_frame_index, actions: Vec::new() }
    }
}

/// The authored three-phase timeline of an emotion video.
///
/// Missing or `null` phase arrays deserialize as empty, so a loop-only timeline is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    #[serde(default, deserialize_with = "phase_or_empty")]
    pub intro_timeline: Vec<TimelineFrame>,
    #[serde(default, deserialize_with = "phase_or_empty")]
    pub loop_timeline: Vec<TimelineFrame>,
    #[serde(default, deserialize_with = "phase_or_empty")]
    pub exit_timeline: Vec<TimelineFrame>,
}

fn phase_or_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<TimelineFrame>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<TimelineFrame>>::deserialize(deserializer)?.unwrap_or_default())
}

/// The soft device-memory budget was exceeded; compilation may still proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameBudgetWarning {
    pub total_frames: usize,
    pub budget: usize,
}

impl fmt::Display for FrameBudgetWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timeline has {} frames, over the {}-frame device budget",
            self.total_frames, self.budget
        )
    }
}

/// Derived frame count and duration, always produced together
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineSummary {
    pub total_frames: usize,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_warning: Option<FrameBudgetWarning>,
}

impl Timeline {
    /// Parse the persisted JSON shape
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn phase(&self, phase: Phase) -> &[TimelineFrame] {
        match phase {
            Phase::Intro => &self.intro_timeline,
            Phase::Loop => &self.loop_timeline,
            Phase::Exit => &self.exit_timeline,
        }
    }

    /// Sum of the three phase lengths
    pub fn total_frames(&self) -> usize {
        Phase::ORDER.iter().map(|&p| self.phase(p).len()).sum()
    }

    /// Playback length in seconds at `fps`
    pub fn duration(&self, fps: f64) -> Result<f64, ValidationError> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(ValidationError::InvalidFps(fps));
        }
        Ok(self.total_frames() as f64 / fps)
    }

    /// Frames in compile order, tagged with their phase
    pub fn frames(&self) -> impl Iterator<Item = (Phase, &TimelineFrame)> + '_ {
        Phase::ORDER
            .into_iter()
            .flat_map(move |p| self.phase(p).iter().map(move |f| (p, f)))
    }

    /// Distinct source indices referenced anywhere in the timeline, ascending
    pub fn distinct_source_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.frames().map(|(_, f)| f.source_frame_index).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Budget check against the default 60-frame ceiling
    pub fn budget_warning(&self) -> Option<FrameBudgetWarning> {
        self.budget_warning_for(FRAME_BUDGET)
    }

    /// Budget check against a custom ceiling. Logs when over; never fails.
    pub fn budget_warning_for(&self, budget: usize) -> Option<FrameBudgetWarning> {
        let total_frames = self.total_frames();
        if total_frames <= budget {
            return None;
        }
        let warning = FrameBudgetWarning { total_frames, budget };
        warn!("{}", warning);
        Some(warning)
    }

    /// Frame count, duration and budget warning computed in one step
    pub fn summary(&self, fps: f64, budget: usize) -> Result<TimelineSummary, ValidationError> {
        Ok(TimelineSummary {
            total_frames: self.total_frames(),
            duration_seconds: self.duration(fps)?,
            budget_warning: self.budget_warning_for(budget),
        })
    }

    /// Replace one phase and return the recomputed summary
    pub fn set_phase(
        &mut self,
        phase: Phase,
        frames: Vec<TimelineFrame>,
        fps: f64,
        budget: usize,
    ) -> Result<TimelineSummary, ValidationError> {
        match phase {
            Phase::Intro => self.intro_timeline = frames,
            Phase::Loop => self.loop_timeline = frames,
            Phase::Exit => self.exit_timeline = frames,
        }
        self.summary(fps, budget)
    }
}
