//! Stats source adapters: roster listing, stats URLs, payload field extraction
//! and per-source metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::num::NonZeroU64;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use mps_core::{Entity, EntityId, MilestoneRule};
use mps_storage::{BrowserHeaders, FallbackFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "mps-adapters";

pub const KNOWN_SOURCES: &[&str] = &["nba", "nhl"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no value at {0}")]
    Missing(String),
    #[error("expected {expected} at {at}")]
    Shape { at: String, expected: &'static str },
    #[error("value at {0} is not a non-negative count")]
    NotACount(String),
    #[error("column {0} not present in result set headers")]
    UnknownColumn(String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("source {source_id} has no stat type {stat_type:?} (supported: {supported})")]
    UnsupportedStat {
        source_id: String,
        stat_type: String,
        supported: String,
    },
    #[error("roster for {source_id} unavailable: {detail}")]
    RosterUnavailable { source_id: String, detail: String },
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Resolves the cumulative statistic inside one stats payload. One
/// implementation per payload shape.
pub trait StatExtractor: Send + Sync + fmt::Debug {
    /// Sum of the statistic across every row the payload carries.
    fn extract(&self, payload: &JsonValue) -> Result<u64, ExtractError>;
}

fn count_value(value: &JsonValue, at: &str) -> Result<u64, ExtractError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f >= 0.0 => Ok(f.trunc() as u64),
        _ => Err(ExtractError::NotACount(at.to_string())),
    }
}

/// Column of a tabular result set, by position or by header name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnRef {
    Index(usize),
    Header(String),
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "#{i}"),
            Self::Header(h) => f.write_str(h),
        }
    }
}

/// Tabular payloads: `resultSets[n].rowSet[*][column]`, summed over rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSetExtractor {
    pub result_set: usize,
    pub column: ColumnRef,
}

impl RowSetExtractor {
    fn column_index(&self, set: &JsonValue) -> Result<usize, ExtractError> {
        match &self.column {
            ColumnRef::Index(i) => Ok(*i),
            ColumnRef::Header(name) => set
                .get("headers")
                .and_then(JsonValue::as_array)
                .and_then(|headers| headers.iter().position(|h| h.as_str() == Some(name.as_str())))
                .ok_or_else(|| ExtractError::UnknownColumn(name.clone())),
        }
    }
}

impl StatExtractor for RowSetExtractor {
    fn extract(&self, payload: &JsonValue) -> Result<u64, ExtractError> {
        let set_at = format!("resultSets[{}]", self.result_set);
        let set = payload
            .get("resultSets")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| ExtractError::Missing("resultSets".to_string()))?
            .get(self.result_set)
            .ok_or_else(|| ExtractError::Missing(set_at.clone()))?;
        let rows = set
            .get("rowSet")
            .ok_or_else(|| ExtractError::Missing(format!("{set_at}.rowSet")))?
            .as_array()
            .ok_or_else(|| ExtractError::Shape {
                at: format!("{set_at}.rowSet"),
                expected: "array of rows",
            })?;
        let column = self.column_index(set)?;

        let mut total = 0u64;
        for (i, row) in rows.iter().enumerate() {
            let at = format!("{set_at}.rowSet[{i}][{}]", self.column);
            let cell = row
                .as_array()
                .ok_or_else(|| ExtractError::Shape {
                    at: format!("{set_at}.rowSet[{i}]"),
                    expected: "array row",
                })?
                .get(column)
                .ok_or_else(|| ExtractError::Missing(at.clone()))?;
            total = total.saturating_add(count_value(cell, &at)?);
        }
        Ok(total)
    }
}

/// Keyed payloads: a dotted object path. A `*` segment fans out over an array
/// and every matched value is summed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPathExtractor {
    pub path: Vec<String>,
}

impl KeyPathExtractor {
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
        }
    }
}

fn collect_path<'a>(value: &'a JsonValue, path: &[String], out: &mut Vec<&'a JsonValue>) {
    match path.split_first() {
        None => out.push(value),
        Some((segment, rest)) if segment == "*" => {
            if let Some(items) = value.as_array() {
                for item in items {
                    collect_path(item, rest, out);
                }
            }
        }
        Some((segment, rest)) => {
            let next = match value {
                JsonValue::Object(map) => map.get(segment),
                JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            if let Some(next) = next {
                collect_path(next, rest, out);
            }
        }
    }
}

impl StatExtractor for KeyPathExtractor {
    fn extract(&self, payload: &JsonValue) -> Result<u64, ExtractError> {
        let at = self.path.join(".");
        let mut matched = Vec::new();
        collect_path(payload, &self.path, &mut matched);
        if matched.is_empty() {
            return Err(ExtractError::Missing(at));
        }
        matched.iter().try_fold(0u64, |total, value| {
            Ok(total.saturating_add(count_value(value, &at)?))
        })
    }
}

/// Configurable extractor selection, as written in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorConfig {
    RowSet {
        #[serde(default)]
        result_set: usize,
        column: ColumnRef,
    },
    KeyPath {
        path: Vec<String>,
    },
}

impl ExtractorConfig {
    pub fn build(&self) -> Box<dyn StatExtractor> {
        match self {
            Self::RowSet { result_set, column } => Box::new(RowSetExtractor {
                result_set: *result_set,
                column: column.clone(),
            }),
            Self::KeyPath { path } => Box::new(KeyPathExtractor { path: path.clone() }),
        }
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().filter(|s| !s.trim().is_empty())
}

fn json_id(value: &JsonValue) -> Option<EntityId> {
    match value {
        JsonValue::Number(n) => n.as_u64().map(EntityId::from),
        JsonValue::String(s) if !s.trim().is_empty() => Some(EntityId::from(s.trim())),
        _ => None,
    }
}

/// A remote data source: where the roster comes from, where per-entity stats
/// live and how to read them.
#[async_trait]
pub trait StatsSource: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn default_stat_type(&self) -> &'static str;
    fn supported_stat_types(&self) -> Vec<&'static str>;
    fn default_milestone(&self) -> MilestoneRule;
    fn default_output_file(&self) -> &'static str;
    fn browser_headers(&self) -> BrowserHeaders;

    fn stats_url(&self, id: &EntityId) -> String;

    fn extractor_for(&self, stat_type: &str) -> Result<ExtractorConfig, AdapterError>;

    fn metadata(&self, entity: &Entity, payload: &JsonValue) -> BTreeMap<String, String>;

    async fn fetch_roster(&self, fetcher: &FallbackFetcher) -> Result<Vec<Entity>, AdapterError>;
}

fn unsupported_stat(source: &dyn StatsSource, stat_type: &str) -> AdapterError {
    AdapterError::UnsupportedStat {
        source_id: source.source_id().to_string(),
        stat_type: stat_type.to_string(),
        supported: source.supported_stat_types().join(", "),
    }
}

fn milestone(step: u64, threshold: u64, min_value: u64) -> MilestoneRule {
    MilestoneRule::new(NonZeroU64::new(step).unwrap_or(NonZeroU64::MIN), threshold, min_value)
}

const NBA_STAT_COLUMNS: &[(&str, &str)] = &[
    ("points", "PTS"),
    ("assists", "AST"),
    ("rebounds", "REB"),
    ("steals", "STL"),
    ("blocks", "BLK"),
    ("threes", "FG3M"),
];

/// Season label the stats site expects, e.g. `2025-26`. Seasons roll over in
/// October.
pub fn nba_season_label(today: NaiveDate) -> String {
    let start = if today.month() >= 10 {
        today.year()
    } else {
        today.year() - 1
    };
    format!("{}-{:02}", start, (start + 1).rem_euclid(100))
}

/// Active players from a `commonallplayers` payload. Rows flagged inactive are
/// skipped.
pub fn parse_nba_roster(payload: &JsonValue) -> Result<Vec<Entity>, ExtractError> {
    let set = payload
        .get("resultSets")
        .and_then(|sets| sets.get(0))
        .ok_or_else(|| ExtractError::Missing("resultSets[0]".to_string()))?;
    let headers: Vec<&str> = set
        .get("headers")
        .and_then(JsonValue::as_array)
        .map(|h| h.iter().filter_map(JsonValue::as_str).collect())
        .unwrap_or_default();
    let index_of = |name: &str, fallback: usize| {
        headers
            .iter()
            .position(|h| *h == name)
            .unwrap_or(fallback)
    };
    let id_col = index_of("PERSON_ID", 0);
    let name_col = index_of("DISPLAY_FIRST_LAST", 2);
    let status_col = headers.iter().position(|h| *h == "ROSTERSTATUS");

    let rows = set
        .get("rowSet")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| ExtractError::Missing("resultSets[0].rowSet".to_string()))?;

    let mut entities = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(cells) = row.as_array() else {
            continue;
        };
        let inactive = status_col
            .and_then(|c| cells.get(c))
            .map(|v| v.as_u64() == Some(0) || v.as_str() == Some("0"))
            .unwrap_or(false);
        if inactive {
            continue;
        }
        let (Some(id), Some(name)) = (
            cells.get(id_col).and_then(json_id),
            cells.get(name_col).and_then(JsonValue::as_str),
        ) else {
            debug!(?row, "skipping unreadable roster row");
            continue;
        };
        entities.push(Entity::new(id, name.trim()));
    }
    Ok(entities)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NbaCareerTotalsSource;

#[async_trait]
impl StatsSource for NbaCareerTotalsSource {
    fn source_id(&self) -> &'static str {
        "nba"
    }

    fn display_name(&self) -> &'static str {
        "NBA career totals (stats.nba.com)"
    }

    fn default_stat_type(&self) -> &'static str {
        "points"
    }

    fn supported_stat_types(&self) -> Vec<&'static str> {
        NBA_STAT_COLUMNS.iter().map(|(stat, _)| *stat).collect()
    }

    fn default_milestone(&self) -> MilestoneRule {
        milestone(1000, 50, 1)
    }

    fn default_output_file(&self) -> &'static str {
        "nba_milestones.json"
    }

    fn browser_headers(&self) -> BrowserHeaders {
        BrowserHeaders::for_site("https://www.nba.com")
    }

    fn stats_url(&self, id: &EntityId) -> String {
        format!(
            "https://stats.nba.com/stats/playercareerstats?LeagueID=00&PerMode=Totals&PlayerID={id}"
        )
    }

    fn extractor_for(&self, stat_type: &str) -> Result<ExtractorConfig, AdapterError> {
        NBA_STAT_COLUMNS
            .iter()
            .find(|(stat, _)| stat.eq_ignore_ascii_case(stat_type))
            .map(|(_, column)| ExtractorConfig::RowSet {
                result_set: 0,
                column: ColumnRef::Header((*column).to_string()),
            })
            .ok_or_else(|| unsupported_stat(self, stat_type))
    }

    fn metadata(&self, entity: &Entity, _payload: &JsonValue) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("team".to_string(), "NBA".to_string()),
            (
                "image_url".to_string(),
                format!(
                    "https://cdn.nba.com/headshots/nba/latest/1040x760/{}.png",
                    entity.id
                ),
            ),
        ])
    }

    async fn fetch_roster(&self, fetcher: &FallbackFetcher) -> Result<Vec<Entity>, AdapterError> {
        let season = nba_season_label(Utc::now().date_naive());
        let url = format!(
            "https://stats.nba.com/stats/commonallplayers?LeagueID=00&Season={season}&IsOnlyCurrentSeason=1"
        );
        let payload = fetcher
            .fetch_with_fallback(&url)
            .await
            .map_err(|err| AdapterError::RosterUnavailable {
                source_id: self.source_id().to_string(),
                detail: err.to_string(),
            })?;
        parse_nba_roster(&payload).map_err(|err| AdapterError::RosterUnavailable {
            source_id: self.source_id().to_string(),
            detail: err.to_string(),
        })
    }
}

pub const NHL_TEAM_ABBREVIATIONS: &[&str] = &[
    "ANA", "BOS", "BUF", "CGY", "CAR", "CHI", "COL", "CBJ", "DAL", "DET", "EDM", "FLA", "LAK",
    "MIN", "MTL", "NSH", "NJD", "NYI", "NYR", "OTT", "PHI", "PIT", "SJS", "SEA", "STL", "TBL",
    "TOR", "UTA", "VAN", "VGK", "WSH", "WPG",
];

const NHL_ROSTER_GROUPS: &[&str] = &["forwards", "defensemen", "goalies"];

const NHL_STAT_TYPES: &[&str] = &["goals", "assists", "points"];

/// Players listed in one `/v1/roster/{team}/current` payload.
pub fn parse_nhl_team_roster(payload: &JsonValue) -> Result<Vec<Entity>, ExtractError> {
    if !payload.is_object() {
        return Err(ExtractError::Shape {
            at: "roster".to_string(),
            expected: "object",
        });
    }
    let mut entities = Vec::new();
    for group in NHL_ROSTER_GROUPS {
        let Some(players) = payload.get(*group).and_then(JsonValue::as_array) else {
            continue;
        };
        for player in players {
            let id = player.get("id").and_then(json_id);
            let first = json_str(player, &["firstName", "default"]);
            let last = json_str(player, &["lastName", "default"]);
            match (id, first, last) {
                (Some(id), Some(first), Some(last)) => {
                    entities.push(Entity::new(id, format!("{} {}", first.trim(), last.trim())))
                }
                _ => debug!(group, ?player, "skipping unreadable roster entry"),
            }
        }
    }
    Ok(entities)
}

#[derive(Debug, Clone)]
pub struct NhlCareerTotalsSource {
    teams: Vec<String>,
}

impl Default for NhlCareerTotalsSource {
    fn default() -> Self {
        Self::with_teams(NHL_TEAM_ABBREVIATIONS.iter().copied())
    }
}

impl NhlCareerTotalsSource {
    pub fn with_teams<I, S>(teams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            teams: teams.into_iter().map(Into::into).collect(),
        }
    }

    pub fn roster_url(team: &str) -> String {
        format!("https://api-web.nhle.com/v1/roster/{team}/current")
    }
}

#[async_trait]
impl StatsSource for NhlCareerTotalsSource {
    fn source_id(&self) -> &'static str {
        "nhl"
    }

    fn display_name(&self) -> &'static str {
        "NHL regular-season career totals (api-web.nhle.com)"
    }

    fn default_stat_type(&self) -> &'static str {
        "goals"
    }

    fn supported_stat_types(&self) -> Vec<&'static str> {
        NHL_STAT_TYPES.to_vec()
    }

    fn default_milestone(&self) -> MilestoneRule {
        milestone(100, 15, 80)
    }

    fn default_output_file(&self) -> &'static str {
        "nhl_milestones.json"
    }

    fn browser_headers(&self) -> BrowserHeaders {
        BrowserHeaders::for_site("https://www.nhl.com")
    }

    fn stats_url(&self, id: &EntityId) -> String {
        format!("https://api-web.nhle.com/v1/player/{id}/landing")
    }

    fn extractor_for(&self, stat_type: &str) -> Result<ExtractorConfig, AdapterError> {
        NHL_STAT_TYPES
            .iter()
            .find(|stat| stat.eq_ignore_ascii_case(stat_type))
            .map(|stat| ExtractorConfig::KeyPath {
                path: vec![
                    "careerTotals".to_string(),
                    "regularSeason".to_string(),
                    (*stat).to_string(),
                ],
            })
            .ok_or_else(|| unsupported_stat(self, stat_type))
    }

    fn metadata(&self, entity: &Entity, payload: &JsonValue) -> BTreeMap<String, String> {
        let team = json_str(payload, &["currentTeamAbbrev"]).unwrap_or("NHL");
        let image_url = json_str(payload, &["headshot"])
            .map(ToString::to_string)
            .unwrap_or_else(|| {
                format!(
                    "https://cms.nhl.bamgrid.com/images/headshots/current/168x168/{}.jpg",
                    entity.id
                )
            });
        BTreeMap::from([
            ("team".to_string(), team.to_string()),
            ("image_url".to_string(), image_url),
        ])
    }

    /// One listing per team. Individual team failures are skipped; the roster
    /// is unavailable only when every listing fails.
    async fn fetch_roster(&self, fetcher: &FallbackFetcher) -> Result<Vec<Entity>, AdapterError> {
        let mut entities = Vec::new();
        let mut failed = Vec::new();

        for team in &self.teams {
            let outcome = fetcher.fetch_with_fallback(&Self::roster_url(team)).await;
            match outcome.map_err(|e| e.to_string()).and_then(|payload| {
                parse_nhl_team_roster(&payload).map_err(|e| e.to_string())
            }) {
                Ok(players) => {
                    debug!(team = team.as_str(), players = players.len(), "team roster loaded");
                    entities.extend(players);
                }
                Err(detail) => {
                    warn!(team = team.as_str(), error = %detail, "team roster unavailable, skipping");
                    failed.push(team.clone());
                }
            }
        }

        if !self.teams.is_empty() && failed.len() == self.teams.len() {
            return Err(AdapterError::RosterUnavailable {
                source_id: self.source_id().to_string(),
                detail: format!("all {} team listings failed", failed.len()),
            });
        }
        Ok(entities)
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn StatsSource>> {
    match source_id.trim().to_ascii_lowercase().as_str() {
        "nba" => Some(Box::new(NbaCareerTotalsSource)),
        "nhl" => Some(Box::new(NhlCareerTotalsSource::default())),
        _ => None,
    }
}

/// Local roster replacement: a JSON array of `{"id": .., "display_name": ..}`.
pub fn load_roster_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<Entity>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use mps_storage::{Channel, ChannelKind, FetchError, FetchOutcome, RateGate};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(rel: &str) -> JsonValue {
        let path = workspace_root().join("fixtures").join(rel);
        let text = fs::read_to_string(&path).expect("read fixture");
        serde_json::from_str(&text).expect("parse fixture")
    }

    /// Serves canned payloads by URL; anything else is a 404.
    #[derive(Debug, Default)]
    struct UrlMapChannel {
        responses: HashMap<String, JsonValue>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Channel for UrlMapChannel {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Direct
        }

        async fn fetch(&self, target_url: &str) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(target_url)
                .cloned()
                .ok_or(FetchError::RemoteRejected {
                    channel: ChannelKind::Direct,
                    status: 404,
                })
        }
    }

    fn fetcher(channel: Arc<UrlMapChannel>) -> FallbackFetcher {
        FallbackFetcher::new(None, channel, RateGate::disabled())
    }

    #[test]
    fn row_set_sums_every_season_row() {
        let payload = fixture("nba/playercareerstats.json");
        let by_index = RowSetExtractor {
            result_set: 0,
            column: ColumnRef::Index(26),
        };
        let by_header = NbaCareerTotalsSource.extractor_for("points").unwrap().build();
        assert_eq!(by_index.extract(&payload).unwrap(), 4960);
        assert_eq!(by_header.extract(&payload).unwrap(), 4960);

        let assists = NbaCareerTotalsSource.extractor_for("ASSISTS").unwrap().build();
        assert_eq!(assists.extract(&payload).unwrap(), 213 + 276 + 350);
    }

    #[test]
    fn row_set_with_no_rows_is_zero() {
        let payload = serde_json::json!({"resultSets": [{"headers": ["PTS"], "rowSet": []}]});
        let extractor = RowSetExtractor {
            result_set: 0,
            column: ColumnRef::Header("PTS".to_string()),
        };
        assert_eq!(extractor.extract(&payload).unwrap(), 0);
    }

    #[test]
    fn row_set_shape_errors_are_reported() {
        let extractor = RowSetExtractor {
            result_set: 0,
            column: ColumnRef::Header("PTS".to_string()),
        };
        let missing = serde_json::json!({"message": "rate limited"});
        assert!(matches!(
            extractor.extract(&missing),
            Err(ExtractError::Missing(_))
        ));

        let no_header = serde_json::json!({"resultSets": [{"headers": ["AST"], "rowSet": [[1]]}]});
        assert!(matches!(
            extractor.extract(&no_header),
            Err(ExtractError::UnknownColumn(_))
        ));

        let null_cell = serde_json::json!({"resultSets": [{"headers": ["PTS"], "rowSet": [[null]]}]});
        assert!(matches!(
            extractor.extract(&null_cell),
            Err(ExtractError::NotACount(_))
        ));

        let negative = serde_json::json!({"resultSets": [{"headers": ["PTS"], "rowSet": [[-4]]}]});
        assert!(extractor.extract(&negative).is_err());
    }

    #[test]
    fn key_path_reads_nested_totals() {
        let payload = fixture("nhl/landing.json");
        let source = NhlCareerTotalsSource::default();
        let goals = source.extractor_for("goals").unwrap().build();
        let points = source.extractor_for("points").unwrap().build();
        assert_eq!(goals.extract(&payload).unwrap(), 391);
        assert_eq!(points.extract(&payload).unwrap(), 1082);
        assert!(source.extractor_for("saves").is_err());
    }

    #[test]
    fn key_path_wildcard_sums_array_elements() {
        let payload = serde_json::json!({
            "seasonTotals": [{"goals": 40}, {"goals": 41.0}, {"goals": 12}]
        });
        let extractor = KeyPathExtractor::new(["seasonTotals", "*", "goals"]);
        assert_eq!(extractor.extract(&payload).unwrap(), 93);

        let missing = KeyPathExtractor::new(["careerTotals", "regularSeason", "goals"]);
        assert!(matches!(
            missing.extract(&payload),
            Err(ExtractError::Missing(at)) if at == "careerTotals.regularSeason.goals"
        ));
    }

    #[test]
    fn extractor_config_parses_from_yaml() {
        let row: ExtractorConfig =
            serde_yaml::from_str("kind: row_set\nresult_set: 0\ncolumn: 26\n").unwrap();
        assert_eq!(
            row,
            ExtractorConfig::RowSet {
                result_set: 0,
                column: ColumnRef::Index(26)
            }
        );
        let header: ExtractorConfig = serde_yaml::from_str("kind: row_set\ncolumn: PTS\n").unwrap();
        assert_eq!(
            header,
            ExtractorConfig::RowSet {
                result_set: 0,
                column: ColumnRef::Header("PTS".to_string())
            }
        );
        let keyed: ExtractorConfig =
            serde_yaml::from_str("kind: key_path\npath: [careerTotals, regularSeason, assists]\n")
                .unwrap();
        assert_eq!(
            keyed.build().extract(&fixture("nhl/landing.json")).unwrap(),
            691
        );
    }

    #[test]
    fn nhl_metadata_prefers_payload_fields() {
        let source = NhlCareerTotalsSource::default();
        let entity = Entity::new(8478402u64, "Connor McDavid");
        let meta = source.metadata(&entity, &fixture("nhl/landing.json"));
        assert_eq!(meta["team"], "EDM");
        assert!(meta["image_url"].ends_with("8478402.png"));

        let bare = source.metadata(&entity, &serde_json::json!({"headshot": ""}));
        assert_eq!(bare["team"], "NHL");
        assert_eq!(
            bare["image_url"],
            "https://cms.nhl.bamgrid.com/images/headshots/current/168x168/8478402.jpg"
        );
    }

    #[test]
    fn nba_roster_skips_inactive_rows() {
        let roster = parse_nba_roster(&fixture("nba/commonallplayers.json")).unwrap();
        assert_eq!(
            roster,
            vec![
                Entity::new(2544u64, "LeBron James"),
                Entity::new(1630162u64, "Anthony Edwards"),
            ]
        );
    }

    #[test]
    fn nba_season_rolls_over_in_october() {
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        assert_eq!(nba_season_label(d(2026, 10, 18)), "2026-27");
        assert_eq!(nba_season_label(d(2026, 3, 1)), "2025-26");
        assert_eq!(nba_season_label(d(2099, 12, 1)), "2099-00");
    }

    #[test]
    fn nhl_team_roster_joins_names_across_groups() {
        let roster = parse_nhl_team_roster(&fixture("nhl/roster.json")).unwrap();
        assert_eq!(roster.len(), 4);
        assert_eq!(roster[0], Entity::new(8478402u64, "Connor McDavid"));
        assert_eq!(roster[3].display_name, "Stuart Skinner");
        assert!(parse_nhl_team_roster(&serde_json::json!([])).is_err());
    }

    #[tokio::test]
    async fn nhl_roster_skips_failed_teams() {
        let source = NhlCareerTotalsSource::with_teams(["EDM", "TOR", "MTL"]);
        let channel = Arc::new(UrlMapChannel {
            responses: HashMap::from([
                (
                    NhlCareerTotalsSource::roster_url("EDM"),
                    fixture("nhl/roster.json"),
                ),
                (
                    NhlCareerTotalsSource::roster_url("TOR"),
                    serde_json::json!({"forwards": [
                        {"id": 8479318, "firstName": {"default": "Auston"}, "lastName": {"default": "Matthews"}}
                    ]}),
                ),
            ]),
            ..Default::default()
        });

        let roster = source.fetch_roster(&fetcher(channel.clone())).await.unwrap();
        assert_eq!(roster.len(), 5);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn nhl_roster_unavailable_when_every_team_fails() {
        let source = NhlCareerTotalsSource::with_teams(["EDM", "TOR"]);
        let err = source
            .fetch_roster(&fetcher(Arc::new(UrlMapChannel::default())))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::RosterUnavailable { .. }));
    }

    #[test]
    fn registry_resolves_known_sources() {
        for id in KNOWN_SOURCES {
            let source = adapter_for_source(id).expect("registered");
            assert_eq!(source.source_id(), *id);
            source
                .extractor_for(source.default_stat_type())
                .expect("default stat supported");
        }
        assert!(adapter_for_source("NHL").is_some());
        assert!(adapter_for_source("mlb").is_none());
    }

    #[test]
    fn roster_file_round_trips_numeric_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.json");
        fs::write(
            &path,
            r#"[{"id": 1, "display_name": "A"}, {"id": "2", "display_name": "B"}]"#,
        )
        .unwrap();
        let roster = load_roster_file(&path).unwrap();
        assert_eq!(roster[0].id.as_str(), "1");
        assert_eq!(roster[1].id.as_str(), "2");
        assert!(load_roster_file(dir.path().join("missing.json")).is_err());
    }
}
