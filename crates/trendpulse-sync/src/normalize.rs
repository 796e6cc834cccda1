//! Raw samples → canonical `TrendRecord`s.

use chrono::{DateTime, Utc};
use tracing::debug;
use trendpulse_core::{
    FetchUnit, Keyword, Rank, RawSample, RawScore, RecordMeta, Source, TrendRecord,
};

/// Why a single sample produced no record. Never escalates to a unit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRejection {
    EmptyKeyword,
    UnparseableScore,
    InvalidRank,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub records: Vec<TrendRecord>,
    /// Malformed samples. Empty keywords are filtered silently and not counted.
    pub dropped: usize,
}

/// Converts samples in adapter order. Samples without an explicit rank get their
/// 1-based position among the samples that survive validation, so inferred ranks
/// stay contiguous.
pub fn normalize(
    source: &Source,
    unit: &FetchUnit,
    samples: Vec<RawSample>,
    collected_at: DateTime<Utc>,
) -> Normalized {
    let mut out = Normalized::default();
    let mut position = 0i64;

    for sample in samples {
        let query_type = sample.query_type.clone();
        let (keyword, explicit_rank, raw_score) = match validate_sample(&sample) {
            Ok(parts) => parts,
            Err(SampleRejection::EmptyKeyword) => continue,
            Err(rejection) => {
                debug!(keyword = %sample.keyword, ?rejection, "dropping malformed sample");
                out.dropped += 1;
                continue;
            }
        };

        position += 1;
        let rank = explicit_rank.or_else(|| Rank::new(position));

        out.records.push(TrendRecord {
            source_id: source.source_id.clone(),
            country: unit.country.country.clone(),
            category_key: unit.category.key.clone(),
            window_period: unit.window.clone(),
            keyword,
            rank,
            raw_score,
            meta: RecordMeta {
                mode: unit.category.mode,
                timeframe: unit.window.provider_timeframe().to_string(),
                geo: unit.country.gt_geo.clone(),
                query_type,
            },
            collected_at,
        });
    }

    out
}

fn validate_sample(
    sample: &RawSample,
) -> Result<(Keyword, Option<Rank>, Option<f64>), SampleRejection> {
    let keyword = Keyword::parse(&sample.keyword).ok_or(SampleRejection::EmptyKeyword)?;
    let rank = match sample.rank {
        None => None,
        Some(raw) => Some(Rank::new(raw).ok_or(SampleRejection::InvalidRank)?),
    };
    let score = match &sample.score {
        None => None,
        Some(score) => parse_score(score)?,
    };
    Ok((keyword, rank, score))
}

/// Numeric scores pass through; text such as `"+1,000"` is parsed after stripping
/// `+`, `,` and whitespace. Blank text means "no score".
pub fn parse_score(score: &RawScore) -> Result<Option<f64>, SampleRejection> {
    match score {
        RawScore::Number(value) if value.is_finite() => Ok(Some(*value)),
        RawScore::Number(_) => Err(SampleRejection::UnparseableScore),
        RawScore::Text(text) => {
            let cleaned: String = text
                .chars()
                .filter(|c| !matches!(c, '+' | ',') && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() {
                return Ok(None);
            }
            cleaned
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Some)
                .ok_or(SampleRejection::UnparseableScore)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use trendpulse_core::{CategorySpec, CountryMapping, Dimensions, RetrievalMode, WindowPeriod};

    fn unit() -> FetchUnit {
        Dimensions::new(
            vec![CountryMapping::from_code("US")],
            vec![WindowPeriod::OneDay],
            vec![CategorySpec::ranked("shopping", Some(18))],
        )
        .unwrap()
        .units()
        .remove(0)
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).single().unwrap()
    }

    fn ranks(normalized: &Normalized) -> Vec<Option<u32>> {
        normalized
            .records
            .iter()
            .map(|r| r.rank.map(Rank::get))
            .collect()
    }

    #[test]
    fn rank_is_inferred_from_position() {
        let samples = ["alpha", "beta", "gamma"]
            .into_iter()
            .map(RawSample::keyword)
            .collect();
        let out = normalize(&Source::default(), &unit(), samples, at());
        let keywords: Vec<&str> = out.records.iter().map(|r| r.keyword.as_str()).collect();
        assert_eq!(keywords, vec!["alpha", "beta", "gamma"]);
        assert_eq!(ranks(&out), vec![Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn explicit_rank_is_kept_as_is() {
        let samples = vec![
            RawSample {
                rank: Some(7),
                ..RawSample::keyword("drone")
            },
            RawSample::keyword("kettle"),
        ];
        let out = normalize(&Source::default(), &unit(), samples, at());
        assert_eq!(ranks(&out), vec![Some(7), Some(2)]);
    }

    #[test]
    fn missing_score_stays_null() {
        let out = normalize(
            &Source::default(),
            &unit(),
            vec![RawSample::keyword("drone")],
            at(),
        );
        assert_eq!(out.records[0].raw_score, None);
    }

    #[test]
    fn empty_keywords_are_filtered_without_counting_and_ranks_stay_contiguous() {
        let samples = vec![
            RawSample::keyword("  drone "),
            RawSample::keyword("   "),
            RawSample::keyword(""),
            RawSample::keyword("espresso machine"),
        ];
        let out = normalize(&Source::default(), &unit(), samples, at());
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.dropped, 0);
        assert_eq!(out.records[0].keyword.as_str(), "drone");
        assert_eq!(ranks(&out), vec![Some(1), Some(2)]);
    }

    #[test]
    fn malformed_samples_are_dropped_and_counted() {
        let samples = vec![
            RawSample {
                score: Some(RawScore::Text("Breakout".into())),
                ..RawSample::keyword("fidget")
            },
            RawSample {
                rank: Some(0),
                ..RawSample::keyword("zero rank")
            },
            RawSample {
                score: Some(RawScore::Text("+1,000".into())),
                ..RawSample::keyword("drone")
            },
        ];
        let out = normalize(&Source::default(), &unit(), samples, at());
        assert_eq!(out.dropped, 2);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].raw_score, Some(1000.0));
        assert_eq!(ranks(&out), vec![Some(1)]);
    }

    #[test]
    fn rank_beyond_the_integer_column_is_dropped() {
        let samples = vec![
            RawSample {
                rank: Some(2_147_483_648),
                ..RawSample::keyword("overflow")
            },
            RawSample {
                rank: Some(i64::from(i32::MAX)),
                ..RawSample::keyword("last place")
            },
        ];
        let out = normalize(&Source::default(), &unit(), samples, at());
        assert_eq!(out.dropped, 1);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].keyword.as_str(), "last place");
        assert_eq!(out.records[0].rank.map(Rank::to_i32), Some(i32::MAX));
    }

    #[test]
    fn records_carry_unit_dimensions_and_provenance() {
        let sample = RawSample {
            query_type: Some("rising".into()),
            score: Some(RawScore::Number(250.0)),
            ..RawSample::keyword("drone")
        };
        let out = normalize(&Source::default(), &unit(), vec![sample], at());
        let record = &out.records[0];
        assert_eq!(record.source_id, "google_trends");
        assert_eq!(record.country, "US");
        assert_eq!(record.category_key.as_str(), "shopping");
        assert_eq!(record.window_period, WindowPeriod::OneDay);
        assert_eq!(record.collected_at, at());
        assert_eq!(record.meta.mode, RetrievalMode::Ranked);
        assert_eq!(record.meta.timeframe, "now 1-d");
        assert_eq!(record.meta.query_type.as_deref(), Some("rising"));
    }

    #[test]
    fn score_text_parsing() {
        assert_eq!(parse_score(&RawScore::Text("2,500+".into())), Ok(Some(2500.0)));
        assert_eq!(parse_score(&RawScore::Text(" ".into())), Ok(None));
        assert_eq!(parse_score(&RawScore::Number(0.0)), Ok(Some(0.0)));
        assert_eq!(
            parse_score(&RawScore::Number(f64::NAN)),
            Err(SampleRejection::UnparseableScore)
        );
    }
}
