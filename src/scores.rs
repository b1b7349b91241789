use chrono::{DateTime, Duration, Utc};

use crate::models::Score;

/// Scores older than this never count as "new", whatever their id says.
/// Keeps a restart from replaying hours of backfill as notifications.
const RECENT_CUTOFF_HOURS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Newest,
    Oldest,
    Accuracy,
    Combo,
    Score,
    Pp,
}

pub fn sort_scores(scores: &mut [Score], by: SortBy) {
    match by {
        SortBy::Newest => scores.sort_by(|a, b| b.ended_at.cmp(&a.ended_at)),
        SortBy::Oldest => scores.sort_by(|a, b| a.ended_at.cmp(&b.ended_at)),
        SortBy::Accuracy => scores.sort_by(|a, b| {
            b.accuracy
                .partial_cmp(&a.accuracy)
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
        SortBy::Combo => scores.sort_by(|a, b| b.max_combo.cmp(&a.max_combo)),
        SortBy::Score => scores.sort_by(|a, b| b.score.cmp(&a.score)),
        SortBy::Pp => scores.sort_by(|a, b| {
            b.pp_value()
                .partial_cmp(&a.pp_value())
                .unwrap_or(std::cmp::Ordering::Equal)
        }),
    }
}

/// A fresh top-100 entry above the watermark, annotated with its pp gap to
/// the next-lower-ranked score in the same listing.
#[derive(Debug, Clone)]
pub struct NewScore {
    pub score: Score,
    pub pp_delta: Option<f64>,
}

/// Scores from `best` (pp-descending) whose id is newer than `watermark` and
/// which ended within the last three hours of `now`.
pub fn get_new_scores(best: &[Score], watermark: u64, now: DateTime<Utc>) -> Vec<NewScore> {
    let cutoff = now - Duration::hours(RECENT_CUTOFF_HOURS);

    best.iter()
        .enumerate()
        .filter(|(_, s)| s.id > watermark && s.ended_at >= cutoff)
        .map(|(i, s)| NewScore {
            score: s.clone(),
            pp_delta: best
                .get(i + 1)
                .map(|next| s.pp_value() - next.pp_value()),
        })
        .collect()
}

/// Whether `candidate` genuinely makes the current top-100: its pp must not
/// be below the 100th-place score, and no equal-or-better score may already
/// exist on the same beatmap.
pub fn qualifies_for_top100(candidate: &Score, best: &[Score]) -> bool {
    let floor = best.last().map(|s| s.pp_value()).unwrap_or(0.0);
    if candidate.pp_value() < floor {
        return false;
    }

    !best
        .iter()
        .any(|s| s.beatmap_id == candidate.beatmap_id && s.pp_value() >= candidate.pp_value())
}

/// 1-based position of a score id within a best-score listing.
pub fn score_position(score_id: u64, best: &[Score]) -> Option<usize> {
    best.iter().position(|s| s.id == score_id).map(|i| i + 1)
}

/// Crude if-full-combo projection from the combo ratio. The real computation
/// belongs to the native difficulty library; keeping this behind one function
/// lets that library replace it without touching any notification code.
pub fn pp_if_fc_estimate(score: &Score) -> Option<f64> {
    let map_combo = score.beatmap.as_ref()?.max_combo? as f64;
    if map_combo <= 0.0 || score.max_combo as f64 >= map_combo {
        return None;
    }
    Some(score.pp_value() * (map_combo / score.max_combo as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GameMode;

    fn score(id: u64, pp: f64, beatmap_id: u64, ended_at: DateTime<Utc>) -> Score {
        Score {
            id,
            user_id: 1,
            beatmap_id,
            mode: GameMode::Osu,
            pp: Some(pp),
            accuracy: 0.97,
            max_combo: 500,
            score: 1_000_000,
            rank: "S".to_string(),
            mods: vec![],
            ended_at,
            beatmap: None,
            beatmapset: None,
        }
    }

    #[test]
    fn test_sort_by_pp_is_non_increasing() {
        let now = Utc::now();
        let mut scores = vec![
            score(1, 120.0, 1, now),
            score(2, 310.0, 2, now),
            score(3, 205.5, 3, now),
        ];
        sort_scores(&mut scores, SortBy::Pp);
        for pair in scores.windows(2) {
            assert!(pair[0].pp_value() >= pair[1].pp_value());
        }
    }

    #[test]
    fn test_sort_oldest_is_non_decreasing() {
        let now = Utc::now();
        let mut scores = vec![
            score(1, 1.0, 1, now),
            score(2, 1.0, 2, now - Duration::hours(2)),
            score(3, 1.0, 3, now - Duration::minutes(5)),
        ];
        sort_scores(&mut scores, SortBy::Oldest);
        for pair in scores.windows(2) {
            assert!(pair[0].ended_at <= pair[1].ended_at);
        }
    }

    #[test]
    fn test_get_new_scores_excludes_stale_plays() {
        let now = Utc::now();
        let best = vec![
            score(50, 300.0, 1, now - Duration::minutes(10)),
            // Newer id than the watermark but four hours old: backfill, skip.
            score(40, 250.0, 2, now - Duration::hours(4)),
            score(10, 200.0, 3, now - Duration::days(30)),
        ];
        let new = get_new_scores(&best, 20, now);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].score.id, 50);
    }

    #[test]
    fn test_get_new_scores_annotates_pp_delta() {
        let now = Utc::now();
        let best = vec![
            score(50, 300.0, 1, now),
            score(49, 250.0, 2, now - Duration::days(1)),
        ];
        let new = get_new_scores(&best, 0, now);
        assert_eq!(new.len(), 1);
        assert!((new[0].pp_delta.unwrap() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_qualifies_rejects_below_floor() {
        let now = Utc::now();
        let best = vec![score(1, 300.0, 1, now), score(2, 100.0, 2, now)];
        let candidate = score(3, 99.0, 3, now);
        assert!(!qualifies_for_top100(&candidate, &best));
    }

    #[test]
    fn test_qualifies_rejects_worse_play_on_same_map() {
        let now = Utc::now();
        let best = vec![score(1, 300.0, 7, now), score(2, 100.0, 2, now)];
        let candidate = score(3, 200.0, 7, now);
        assert!(!qualifies_for_top100(&candidate, &best));
    }

    #[test]
    fn test_qualifies_accepts_improvement() {
        let now = Utc::now();
        let best = vec![score(1, 300.0, 7, now), score(2, 100.0, 2, now)];
        let candidate = score(3, 350.0, 7, now);
        assert!(qualifies_for_top100(&candidate, &best));
        let fresh_map = score(4, 150.0, 9, now);
        assert!(qualifies_for_top100(&fresh_map, &best));
    }

    #[test]
    fn test_pp_if_fc_estimate_requires_map_combo() {
        let play = score(1, 100.0, 1, Utc::now());
        assert!(pp_if_fc_estimate(&play).is_none());
    }

    #[test]
    fn test_pp_if_fc_estimate_scales_with_missing_combo() {
        use crate::models::{Beatmap, RankStatus};

        let mut play = score(1, 100.0, 1, Utc::now());
        play.max_combo = 400;
        play.beatmap = Some(Beatmap {
            id: 1,
            beatmapset_id: 1,
            mode: GameMode::Osu,
            version: "Extra".to_string(),
            difficulty_rating: 5.6,
            status: RankStatus::Ranked,
            total_length: 120,
            bpm: 180.0,
            max_combo: Some(900),
        });
        let estimate = pp_if_fc_estimate(&play).unwrap();
        assert!((estimate - 100.0 * (900.0f64 / 400.0).sqrt()).abs() < 1e-9);

        // A full combo has nothing left to project.
        play.max_combo = 900;
        assert!(pp_if_fc_estimate(&play).is_none());
    }

    #[test]
    fn test_score_position() {
        let now = Utc::now();
        let best = vec![score(5, 300.0, 1, now), score(6, 200.0, 2, now)];
        assert_eq!(score_position(6, &best), Some(2));
        assert_eq!(score_position(7, &best), None);
    }
}
