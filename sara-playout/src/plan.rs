//! Mix plan resolution
//!
//! Pure function from an item's markers and the global fade default to the
//! transition plan: where the next item starts (`mix_at`, stream-absolute
//! seconds) and how long the outgoing fade runs. Precedence: explicit
//! segue, then overlap, then the global fade; a break marker suppresses
//! the mix entirely.

use crate::model::PlaylistItem;

/// Resolved transition plan for one playing item
#[derive(Debug, Clone)]
pub struct MixPlan {
    /// Stream-absolute second at which the next item starts; `None` means
    /// no automix for this item
    pub mix_at: Option<f64>,
    /// Linear fade applied to the outgoing item across the transition
    pub fade_seconds: f64,
    /// Cue-in of the item (absolute)
    pub base_cue: f64,
    /// Playable length from cue-in, possibly overridden by the real
    /// stream length
    pub effective_duration: f64,
    /// Whether the backend supports sample-accurate trigger callbacks
    pub native_trigger: bool,
    /// Single-shot latch: has this plan's mix fired?
    pub triggered: bool,
}

impl MixPlan {
    /// Absolute end of playable audio.
    pub fn track_end(&self) -> f64 {
        self.base_cue + self.effective_duration
    }
}

/// Pure resolver; never mutates the item
pub struct MixPlanner;

impl MixPlanner {
    /// Resolve the plan for `item` against the global fade default and an
    /// optional effective-duration override from the actual stream length.
    pub fn resolve(
        item: &PlaylistItem,
        fade_default: f64,
        effective_duration_override: Option<f64>,
    ) -> MixPlan {
        let base_cue = item.cue_in_seconds.unwrap_or(0.0);
        let effective_duration = effective_duration_override
            .map(|d| d.max(0.0))
            .unwrap_or_else(|| item.effective_duration_seconds());
        let track_end = base_cue + effective_duration;

        let mut plan = MixPlan {
            mix_at: None,
            fade_seconds: 0.0,
            base_cue,
            effective_duration,
            native_trigger: false,
            triggered: false,
        };

        // A break stops auto-mix outright, whatever markers are set
        if item.break_after {
            return plan;
        }

        if let Some(segue) = item.segue_seconds {
            plan.mix_at = Some(segue);
            plan.fade_seconds = item.segue_fade_seconds.unwrap_or(fade_default).max(0.0);
        } else if let Some(overlap) = item.overlap_seconds {
            let overlap = overlap.max(0.0);
            plan.mix_at = Some((track_end - overlap).max(base_cue));
            plan.fade_seconds = overlap.min(effective_duration);
        } else if fade_default > 0.0 {
            plan.mix_at = Some((track_end - fade_default).max(base_cue));
            plan.fade_seconds = fade_default;
        }

        plan
    }
}
