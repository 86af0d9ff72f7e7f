//! Interpolation methods for target trajectories
//!
//! A target series is the Expected-subtype line of a measure link: a list
//! of (date, value) points sorted by date ascending. The expected value at
//! an arbitrary date is obtained by interpolating inside the series; dates
//! outside the series have no expected value (extrapolation is never
//! performed).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A target series point: effective date and planned value
pub type SeriesPoint = (NaiveDate, f64);

/// Interpolation methods for computing expected values between target points
///
/// - Linear: straight line between bracketing points
/// - Step: holds the last target at or before the date
/// - Exponential: geometric growth between bracketing points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationMethod {
    /// v = vᵢ + (vᵢ₊₁ − vᵢ) × f where f is the elapsed fraction of the interval
    Linear,

    /// v = vᵢ (no interpolation between points)
    Step,

    /// v = vᵢ × (vᵢ₊₁/vᵢ)^f; undefined when vᵢ ≤ 0
    Exponential,
}

impl InterpolationMethod {
    /// Expected value of `series` at `date`
    ///
    /// `series` must be sorted by date ascending. Returns `None` when:
    /// - the series is empty,
    /// - `date` is before the first or after the last point (no
    ///   extrapolation),
    /// - the method is `Exponential` and the left bracketing value is ≤ 0.
    ///
    /// A date exactly matching a stored point returns that point's value
    /// under every method.
    pub fn expected_value_at(&self, series: &[SeriesPoint], date: NaiveDate) -> Option<f64> {
        let (first, last) = match (series.first(), series.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return None,
        };

        if date < first.0 || date > last.0 {
            return None;
        }

        // Exact match wins regardless of method
        if let Some((_, v)) = series.iter().find(|(d, _)| *d == date) {
            return Some(*v);
        }

        // Bracketing interval (dᵢ, dᵢ₊₁) with dᵢ < date < dᵢ₊₁
        let idx = series.iter().rposition(|(d, _)| *d < date)?;
        let (d0, v0) = series[idx];
        let (d1, v1) = series[idx + 1];

        match self {
            InterpolationMethod::Step => Some(v0),
            InterpolationMethod::Linear => {
                let f = interval_fraction(d0, d1, date);
                Some(v0 + (v1 - v0) * f)
            }
            InterpolationMethod::Exponential => {
                if v0 <= 0.0 {
                    return None;
                }
                let f = interval_fraction(d0, d1, date);
                Some(v0 * (v1 / v0).powf(f))
            }
        }
    }

    /// Value of the reconnect trajectory from `(from_date, from_value)` to
    /// `(to_date, to_value)` at `date`, following this method's shape.
    ///
    /// Used by replanning to redistribute intermediate target points. `date`
    /// must lie within [from_date, to_date]; returns `None` outside that
    /// window or when the shape is undefined (exponential with a
    /// non-positive start value).
    pub fn reconnect_value_at(
        &self,
        from: SeriesPoint,
        to: SeriesPoint,
        date: NaiveDate,
    ) -> Option<f64> {
        self.expected_value_at(&[from, to], date)
    }

    /// Parse method from string (from database/settings)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Some(InterpolationMethod::Linear),
            "step" => Some(InterpolationMethod::Step),
            "exponential" => Some(InterpolationMethod::Exponential),
            _ => None,
        }
    }

    /// Canonical database string representation
    pub fn as_db_string(&self) -> &'static str {
        match self {
            InterpolationMethod::Linear => "linear",
            InterpolationMethod::Step => "step",
            InterpolationMethod::Exponential => "exponential",
        }
    }

    /// All available interpolation methods
    pub fn all_variants() -> &'static [InterpolationMethod] {
        &[
            InterpolationMethod::Linear,
            InterpolationMethod::Step,
            InterpolationMethod::Exponential,
        ]
    }
}

impl Default for InterpolationMethod {
    fn default() -> Self {
        InterpolationMethod::Linear
    }
}

impl std::fmt::Display for InterpolationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_db_string())
    }
}

/// Elapsed fraction of the interval [d0, d1] at `date`
fn interval_fraction(d0: NaiveDate, d1: NaiveDate, date: NaiveDate) -> f64 {
    let span = (d1 - d0).num_days() as f64;
    let elapsed = (date - d0).num_days() as f64;
    elapsed / span
}
