//! Shrink schedules for multi-resolution pyramids.
//!
//! A [`Schedule`] is a table with one row per pyramid level and one column
//! per image axis. Entry `(k, j)` is the factor by which level `k` shrinks
//! axis `j`. Rows run from coarsest (level 0) to finest.

use crate::core::error::{PipelineError, PipelineResult};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest shift used when computing `2^(levels - 1)`.
const MAX_SHIFT: u32 = 31;

/// Per-level, per-axis shrink factors.
///
/// Every entry is at least 1 and no entry exceeds the entry above it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    rows: Vec<Vec<u32>>,
}

impl Schedule {
    /// Number of levels (rows).
    pub fn num_levels(&self) -> usize {
        self.rows.len()
    }

    /// Number of axes (columns).
    pub fn num_axes(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    /// Factors of level `level`.
    pub fn level(&self, level: usize) -> Option<&[u32]> {
        self.rows.get(level).map(Vec::as_slice)
    }

    /// All rows, coarsest first.
    pub fn rows(&self) -> &[Vec<u32>] {
        &self.rows
    }

    /// Whether every factor divides the factor above it exactly.
    pub fn is_downward_divisible(&self) -> bool {
        self.rows
            .windows(2)
            .all(|pair| pair[0].iter().zip(&pair[1]).all(|(above, below)| above % below == 0))
    }

    /// Keep the first `levels` rows. When `levels` exceeds the current row
    /// count, the last row is repeated.
    pub fn truncated(&self, levels: usize) -> Schedule {
        let levels = levels.max(1);
        let last = self.rows.last().cloned().unwrap_or_default();
        let rows = (0..levels)
            .map(|k| self.rows.get(k).cloned().unwrap_or_else(|| last.clone()))
            .collect();
        Schedule { rows }
    }

    /// Check the table shape against a level and axis count.
    pub fn check_shape(&self, levels: usize, axes: usize) -> PipelineResult<()> {
        if self.num_levels() != levels {
            return Err(PipelineError::InvalidSchedule {
                reason: format!(
                    "schedule has {} rows but {} levels are configured",
                    self.num_levels(),
                    levels
                ),
            });
        }
        if let Some(row) = self.rows.iter().position(|r| r.len() != axes) {
            return Err(PipelineError::InvalidSchedule {
                reason: format!(
                    "row {} has {} columns but the image has {} axes",
                    row,
                    self.rows[row].len(),
                    axes
                ),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (level, row) in self.rows.iter().enumerate() {
            let factors: Vec<String> = row.iter().map(u32::to_string).collect();
            writeln!(f, "level {}: [{}]", level, factors.join(", "))?;
        }
        Ok(())
    }
}

/// Builds [`Schedule`]s.
pub struct ScheduleBuilder;

impl ScheduleBuilder {
    /// Halve every axis per level, ending at full resolution.
    ///
    /// Level 0 shrinks every axis by `2^(num_levels - 1)`.
    pub fn build_from_level_count(num_levels: usize, num_axes: usize) -> Schedule {
        let num_levels = clamp_levels(num_levels);
        let shift = (num_levels as u32 - 1).min(MAX_SHIFT);
        let start = vec![1u32 << shift; num_axes];
        halving_rows(&start, num_levels)
    }

    /// Halve the given starting factors per level.
    ///
    /// Starting factors below 1 are raised to 1.
    pub fn build_from_start_factors(start: &[u32], num_levels: usize) -> Schedule {
        let num_levels = clamp_levels(num_levels);
        let start: Vec<u32> = start.iter().map(|&f| f.max(1)).collect();
        halving_rows(&start, num_levels)
    }

    /// Accept an explicit table.
    ///
    /// Entries below 1 become 1, and each entry is capped at the entry
    /// above it so factors never grow towards finer levels.
    pub fn from_table(table: &[Vec<i64>]) -> PipelineResult<Schedule> {
        if table.is_empty() {
            return Err(PipelineError::InvalidSchedule {
                reason: "schedule has no rows".to_string(),
            });
        }
        let axes = table[0].len();
        if let Some(row) = table.iter().position(|r| r.len() != axes) {
            return Err(PipelineError::InvalidSchedule {
                reason: format!("row {} has {} columns, expected {}", row, table[row].len(), axes),
            });
        }

        let mut rows: Vec<Vec<u32>> = Vec::with_capacity(table.len());
        let mut adjusted = false;
        for row in table {
            let mut clamped = Vec::with_capacity(axes);
            for (axis, &factor) in row.iter().enumerate() {
                let mut value = factor.clamp(1, u32::MAX as i64) as u32;
                if let Some(above) = rows.last() {
                    value = value.min(above[axis]);
                }
                adjusted |= value as i64 != factor;
                clamped.push(value);
            }
            rows.push(clamped);
        }
        if adjusted {
            warn!("Shrink schedule entries were clamped to keep factors >= 1 and non-increasing");
        }
        Ok(Schedule { rows })
    }
}

fn clamp_levels(num_levels: usize) -> usize {
    if num_levels == 0 {
        warn!("Number of levels must be at least 1; using 1");
        1
    } else {
        num_levels
    }
}

fn halving_rows(start: &[u32], num_levels: usize) -> Schedule {
    let rows = (0..num_levels)
        .map(|k| {
            let shift = (k as u32).min(MAX_SHIFT);
            start.iter().map(|&f| (f >> shift).max(1)).collect()
        })
        .collect();
    Schedule { rows }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_level_count() {
        let schedule = ScheduleBuilder::build_from_level_count(3, 3);
        assert_eq!(
            schedule.rows(),
            &[vec![4, 4, 4], vec![2, 2, 2], vec![1, 1, 1]]
        );
        assert!(schedule.is_downward_divisible());
        assert_eq!(schedule.num_axes(), 3);
    }

    #[test]
    fn test_build_from_start_factors() {
        let schedule = ScheduleBuilder::build_from_start_factors(&[8, 4, 2], 4);
        assert_eq!(
            schedule.rows(),
            &[vec![8, 4, 2], vec![4, 2, 1], vec![2, 1, 1], vec![1, 1, 1]]
        );
        assert!(schedule.is_downward_divisible());
    }

    #[test]
    fn test_zero_levels_become_one() {
        let schedule = ScheduleBuilder::build_from_level_count(0, 2);
        assert_eq!(schedule.rows(), &[vec![1, 1]]);

        let schedule = ScheduleBuilder::build_from_start_factors(&[0, 3], 0);
        assert_eq!(schedule.rows(), &[vec![1, 3]]);
    }

    #[test]
    fn test_large_level_count_does_not_overflow() {
        let schedule = ScheduleBuilder::build_from_level_count(40, 1);
        assert_eq!(schedule.level(0), Some(&[1u32 << 31][..]));
        assert_eq!(schedule.level(39), Some(&[1u32][..]));
    }

    #[test]
    fn test_from_table_clamps() {
        let schedule = ScheduleBuilder::from_table(&[vec![4, 0], vec![8, -2], vec![1, 1]]).unwrap();
        assert_eq!(schedule.rows(), &[vec![4, 1], vec![4, 1], vec![1, 1]]);
        assert!(schedule.rows().iter().flatten().all(|&f| f >= 1));
    }

    #[test]
    fn test_from_table_rejects_ragged_rows() {
        let result = ScheduleBuilder::from_table(&[vec![2, 2], vec![1]]);
        assert!(matches!(result, Err(PipelineError::InvalidSchedule { .. })));
        assert!(ScheduleBuilder::from_table(&[]).is_err());
    }

    #[test]
    fn test_not_downward_divisible() {
        let schedule = ScheduleBuilder::from_table(&[vec![3], vec![2], vec![1]]).unwrap();
        assert!(!schedule.is_downward_divisible());
    }

    #[test]
    fn test_truncated_and_shape() {
        let schedule = ScheduleBuilder::build_from_level_count(3, 2);
        assert!(schedule.check_shape(3, 2).is_ok());
        assert!(schedule.check_shape(2, 2).is_err());
        assert!(schedule.check_shape(3, 3).is_err());

        let shorter = schedule.truncated(2);
        assert_eq!(shorter.rows(), &[vec![4, 4], vec![2, 2]]);
        let longer = schedule.truncated(4);
        assert_eq!(longer.level(3), Some(&[1u32, 1][..]));
    }

    #[test]
    fn test_display() {
        let text = ScheduleBuilder::build_from_level_count(2, 2).to_string();
        assert!(text.contains("level 0: [2, 2]"));
        assert!(text.contains("level 1: [1, 1]"));
    }
}
