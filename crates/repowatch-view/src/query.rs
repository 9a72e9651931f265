//! Search, filter and sort over cached repositories.
//!
//! [`derive_view`] is a pure function of its inputs; [`QueryState`] holds the
//! three user-adjustable parameters and notifies subscribers when any of
//! them changes.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

use repowatch_github::RepositorySummary;

/// Row predicate applied after search.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum FilterOption {
    #[default]
    All,
    /// Case-insensitive match on `language`. Rows without a language never match.
    Language(String),
    /// Case-insensitive membership in `topics`.
    Topic(String),
}

impl FilterOption {
    pub fn java() -> Self {
        FilterOption::Language("Java".to_string())
    }

    pub fn kotlin() -> Self {
        FilterOption::Language("Kotlin".to_string())
    }

    pub fn android() -> Self {
        FilterOption::Topic("android".to_string())
    }

    /// The choices offered by default.
    pub fn presets() -> Vec<FilterOption> {
        vec![
            FilterOption::All,
            FilterOption::java(),
            FilterOption::kotlin(),
            FilterOption::android(),
        ]
    }

    pub fn matches(&self, repo: &RepositorySummary) -> bool {
        match self {
            FilterOption::All => true,
            FilterOption::Language(language) => repo
                .language
                .as_deref()
                .is_some_and(|l| l.to_lowercase() == language.to_lowercase()),
            FilterOption::Topic(topic) => {
                let topic = topic.to_lowercase();
                repo.topics.iter().any(|t| t.to_lowercase() == topic)
            }
        }
    }
}

impl fmt::Display for FilterOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterOption::All => f.write_str("all"),
            FilterOption::Language(language) => write!(f, "language:{}", language),
            FilterOption::Topic(topic) => write!(f, "topic:{}", topic),
        }
    }
}

impl FromStr for FilterOption {
    type Err = String;

    /// Accepts `all`, `language:<name>`, `topic:<name>` and the preset
    /// shorthands `java`, `kotlin`, `android`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => return Ok(FilterOption::All),
            "java" => return Ok(FilterOption::java()),
            "kotlin" => return Ok(FilterOption::kotlin()),
            "android" => return Ok(FilterOption::android()),
            _ => {}
        }
        match s.split_once(':') {
            Some(("language", value)) if !value.is_empty() => {
                Ok(FilterOption::Language(value.to_string()))
            }
            Some(("topic", value)) if !value.is_empty() => Ok(FilterOption::Topic(value.to_string())),
            _ => Err(format!("unknown filter: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortField {
    Name,
    Stars,
    /// Compared as an opaque string.
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SortOption {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortOption {
    pub const NAME_ASC: SortOption = SortOption::new(SortField::Name, SortDirection::Ascending);
    pub const NAME_DESC: SortOption = SortOption::new(SortField::Name, SortDirection::Descending);
    pub const STARS_ASC: SortOption = SortOption::new(SortField::Stars, SortDirection::Ascending);
    pub const STARS_DESC: SortOption = SortOption::new(SortField::Stars, SortDirection::Descending);
    pub const UPDATED_ASC: SortOption =
        SortOption::new(SortField::UpdatedAt, SortDirection::Ascending);
    pub const UPDATED_DESC: SortOption =
        SortOption::new(SortField::UpdatedAt, SortDirection::Descending);

    pub const PRESETS: [SortOption; 6] = [
        Self::NAME_ASC,
        Self::NAME_DESC,
        Self::STARS_ASC,
        Self::STARS_DESC,
        Self::UPDATED_ASC,
        Self::UPDATED_DESC,
    ];

    pub const fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    pub fn compare(&self, a: &RepositorySummary, b: &RepositorySummary) -> Ordering {
        let ordering = match self.field {
            SortField::Name => a.name.cmp(&b.name),
            SortField::Stars => a.stars.cmp(&b.stars),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        };
        match self.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }
}

impl Default for SortOption {
    fn default() -> Self {
        Self::NAME_ASC
    }
}

impl fmt::Display for SortOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = match self.field {
            SortField::Name => "name",
            SortField::Stars => "stars",
            SortField::UpdatedAt => "updated",
        };
        let direction = match self.direction {
            SortDirection::Ascending => "asc",
            SortDirection::Descending => "desc",
        };
        write!(f, "{}-{}", field, direction)
    }
}

impl FromStr for SortOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::PRESETS
            .into_iter()
            .find(|option| option.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown sort option: {}", s))
    }
}

/// Everything the derived view depends on besides the rows themselves.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryParams {
    pub search_text: String,
    pub filter: FilterOption,
    pub sort: SortOption,
}

/// Rows whose name or description contains `text`, ignoring case.
///
/// Blank text matches everything.
pub fn search(rows: &[RepositorySummary], text: &str) -> Vec<RepositorySummary> {
    if text.trim().is_empty() {
        return rows.to_vec();
    }
    let needle = text.to_lowercase();
    rows.iter()
        .filter(|repo| {
            repo.name.to_lowercase().contains(&needle)
                || repo
                    .description
                    .as_deref()
                    .is_some_and(|d| d.to_lowercase().contains(&needle))
        })
        .cloned()
        .collect()
}

pub fn filter(rows: &[RepositorySummary], option: &FilterOption) -> Vec<RepositorySummary> {
    rows.iter().filter(|repo| option.matches(repo)).cloned().collect()
}

/// Stable sort: rows with equal keys keep their input order in both directions.
pub fn sort(mut rows: Vec<RepositorySummary>, option: SortOption) -> Vec<RepositorySummary> {
    rows.sort_by(|a, b| option.compare(a, b));
    rows
}

/// Search, then filter, then sort.
pub fn derive_view(rows: &[RepositorySummary], params: &QueryParams) -> Vec<RepositorySummary> {
    let searched = search(rows, &params.search_text);
    let filtered = filter(&searched, &params.filter);
    sort(filtered, params.sort)
}

/// Shared, observable query parameters.
///
/// Setters that do not change the value do not notify.
#[derive(Debug, Clone)]
pub struct QueryState {
    params: Arc<watch::Sender<QueryParams>>,
}

impl Default for QueryState {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryState {
    pub fn new() -> Self {
        Self {
            params: Arc::new(watch::channel(QueryParams::default()).0),
        }
    }

    pub fn params(&self) -> QueryParams {
        self.params.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueryParams> {
        self.params.subscribe()
    }

    pub fn set_search_text(&self, text: impl Into<String>) {
        let text = text.into();
        self.params.send_if_modified(|params| {
            if params.search_text == text {
                return false;
            }
            params.search_text = text;
            true
        });
    }

    pub fn clear_search(&self) {
        self.set_search_text(String::new());
    }

    pub fn set_filter(&self, filter: FilterOption) {
        self.params.send_if_modified(|params| {
            if params.filter == filter {
                return false;
            }
            params.filter = filter;
            true
        });
    }

    pub fn set_sort(&self, sort: SortOption) {
        self.params.send_if_modified(|params| {
            if params.sort == sort {
                return false;
            }
            params.sort = sort;
            true
        });
    }

    /// Restore search, filter and sort to their defaults in one change.
    pub fn reset(&self) {
        self.params.send_if_modified(|params| {
            if *params == QueryParams::default() {
                return false;
            }
            *params = QueryParams::default();
            true
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::collections::BTreeSet;

    fn repo(name: &str, language: Option<&str>, stars: u32) -> RepositorySummary {
        RepositorySummary {
            id: stars as i64,
            name: name.to_string(),
            description: None,
            language: language.map(str::to_string),
            stars,
            forks: 0,
            open_issues_count: 0,
            html_url: format!("https://github.com/intuit/{}", name),
            created_at: "2020-01-01T00:00:00Z".to_string(),
            updated_at: "2024-01-01T00:00:00Z".to_string(),
            topics: BTreeSet::new(),
        }
    }

    fn names(rows: &[RepositorySummary]) -> Vec<&str> {
        rows.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_language_filter() {
        let rows = vec![
            repo("android-app", Some("Kotlin"), 100),
            repo("java-lib", Some("Java"), 200),
        ];
        let params = QueryParams {
            filter: FilterOption::kotlin(),
            ..QueryParams::default()
        };

        assert_eq!(derive_view(&rows, &params), vec![rows[0].clone()]);
    }

    #[test]
    fn test_language_filter_ignores_case_and_missing_language() {
        let rows = vec![repo("a", Some("KOTLIN"), 1), repo("b", None, 2)];
        assert_eq!(names(&filter(&rows, &FilterOption::kotlin())), vec!["a"]);
    }

    #[test]
    fn test_topic_filter() {
        let mut tagged = repo("app", Some("Kotlin"), 1);
        tagged.topics.insert("Android".to_string());
        let rows = vec![tagged, repo("lib", Some("Kotlin"), 2)];

        assert_eq!(names(&filter(&rows, &FilterOption::android())), vec!["app"]);
    }

    #[test]
    fn test_name_ascending() {
        let rows = vec![
            repo("c-app", None, 1),
            repo("a-app", None, 2),
            repo("b-app", None, 3),
        ];
        let sorted = derive_view(&rows, &QueryParams::default());
        assert_eq!(names(&sorted), vec!["a-app", "b-app", "c-app"]);
    }

    #[test]
    fn test_sort_is_stable_in_both_directions() {
        let rows = vec![
            repo("first", None, 5),
            repo("second", None, 9),
            repo("third", None, 5),
            repo("fourth", None, 9),
        ];

        let asc = sort(rows.clone(), SortOption::STARS_ASC);
        assert_eq!(names(&asc), vec!["first", "third", "second", "fourth"]);

        let desc = sort(rows, SortOption::STARS_DESC);
        assert_eq!(names(&desc), vec!["second", "fourth", "first", "third"]);
    }

    #[test]
    fn test_updated_sort_is_lexicographic() {
        let mut old = repo("old", None, 1);
        old.updated_at = "2021-06-01T00:00:00Z".to_string();
        let mut new = repo("new", None, 2);
        new.updated_at = "2023-01-01T00:00:00Z".to_string();

        let sorted = sort(vec![old, new], SortOption::UPDATED_DESC);
        assert_eq!(names(&sorted), vec!["new", "old"]);
    }

    #[test]
    fn test_search_is_case_insensitive() {
        let mut described = repo("lib", None, 1);
        described.description = Some("Android helpers".to_string());
        let rows = vec![repo("android-app", None, 2), described, repo("web", None, 3)];

        let upper = search(&rows, "ANDROID");
        assert_eq!(upper, search(&rows, "android"));
        assert_eq!(names(&upper), vec!["android-app", "lib"]);
    }

    #[test]
    fn test_blank_search_and_all_filter_are_identity() {
        let rows = vec![repo("b", Some("Java"), 1), repo("a", None, 2)];
        assert_eq!(search(&rows, ""), rows);
        assert_eq!(search(&rows, "   "), rows);
        assert_eq!(filter(&rows, &FilterOption::All), rows);
    }

    #[test]
    fn test_derive_view_is_referentially_transparent() {
        let rows = vec![
            repo("kotlin-b", Some("Kotlin"), 3),
            repo("kotlin-a", Some("Kotlin"), 3),
            repo("java", Some("Java"), 7),
        ];
        let params = QueryParams {
            search_text: "KOT".to_string(),
            filter: FilterOption::kotlin(),
            sort: SortOption::STARS_DESC,
        };

        let first = derive_view(&rows, &params);
        let _ = derive_view(&rows, &QueryParams::default());
        let second = derive_view(&rows, &params);

        assert_eq!(first, second);
        assert_eq!(names(&first), vec!["kotlin-b", "kotlin-a"]);
    }

    #[test]
    fn test_sort_option_parse() {
        assert_eq!("stars-desc".parse::<SortOption>(), Ok(SortOption::STARS_DESC));
        assert_eq!("NAME-ASC".parse::<SortOption>(), Ok(SortOption::NAME_ASC));
        assert!("size-asc".parse::<SortOption>().is_err());
    }

    #[test]
    fn test_filter_option_parse() {
        assert_eq!("java".parse::<FilterOption>(), Ok(FilterOption::java()));
        assert_eq!(
            "topic:mobile".parse::<FilterOption>(),
            Ok(FilterOption::Topic("mobile".to_string()))
        );
        assert!("language:".parse::<FilterOption>().is_err());
    }

    #[tokio::test]
    async fn test_query_state_notifies_on_change_only() {
        let state = QueryState::new();
        let mut changes = state.subscribe();

        state.set_sort(SortOption::NAME_ASC);
        assert!(!changes.has_changed().unwrap());

        state.set_search_text("android");
        state.set_filter(FilterOption::kotlin());
        assert!(changes.has_changed().unwrap());
        let params = changes.borrow_and_update().clone();
        assert_eq!(params.search_text, "android");
        assert_eq!(params.filter, FilterOption::kotlin());

        state.reset();
        assert_eq!(state.params(), QueryParams::default());
        assert!(changes.has_changed().unwrap());
    }
}
