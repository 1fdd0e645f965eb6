//! Outline document model for Org-style plain-text files.
//!
//! The structural logic lives in two places: the depth-keyed outline tree (`tree`)
//! and the temporal model with its repeat-shift engine (`temporal`, `repeat`).
//! `parser` and `format` are thin adapters that feed and render those structures.

pub mod core {
    use crate::settings::HeadingPrioritySetting;
    use crate::settings::PropertyInheritance;
    use crate::temporal::{Planning, PlanningKind, Timestamp, Timing};
    use crate::tree::PositionId;
    use chrono::Duration;
    use indexmap::{IndexMap, IndexSet};
    use serde::{Deserialize, Serialize};
    use std::{cmp::Ordering, str::FromStr};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocumentId(pub Uuid);

    impl DocumentId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for DocumentId {
        fn default() -> Self {
            Self::new()
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Tag as written after a headline (`:work:urgent:`). Matching is case-sensitive.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Tag(pub String);

    impl Tag {
        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    impl From<String> for Tag {
        fn from(s: String) -> Self {
            Self(s)
        }
    }

    pub const ALPHA_DEFAULT_PRIORITY: char = 'B';
    pub const NUMERIC_DEFAULT_PRIORITY: u8 = 32;

    /// Priority cookie of a headline (`[#A]`, `[#7]`).
    ///
    /// Significance runs opposite to the natural order of the value: `1` outranks `2`
    /// and `A` outranks `B`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub enum HeadingPriority {
        Integer(u8),
        Alpha(char),
        #[default]
        Unset,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum HeadingPriorityKind {
        Integer,
        Alpha,
    }

    impl HeadingPriority {
        pub fn is_set(&self) -> bool {
            !matches!(self, Self::Unset)
        }

        pub fn kind(&self) -> Option<HeadingPriorityKind> {
            match self {
                Self::Integer(_) => Some(HeadingPriorityKind::Integer),
                Self::Alpha(_) => Some(HeadingPriorityKind::Alpha),
                Self::Unset => None,
            }
        }

        /// Compares two priorities by significance; `Greater` means `self` outranks `other`.
        ///
        /// Works without any buffer settings: an unset priority stands in for the
        /// conventional default of the other side's kind. Integer and alpha priorities
        /// are not comparable.
        pub fn significance_cmp(&self, other: &Self) -> Option<Ordering> {
            match (self.context_free(other), other.context_free(self)) {
                (Self::Integer(a), Self::Integer(b)) => Some(b.cmp(&a)),
                (Self::Alpha(a), Self::Alpha(b)) => {
                    Some(b.to_ascii_uppercase().cmp(&a.to_ascii_uppercase()))
                }
                (Self::Unset, Self::Unset) => Some(Ordering::Equal),
                _ => None,
            }
        }

        pub fn is_more_significant_than(&self, other: &Self) -> bool {
            self.significance_cmp(other) == Some(Ordering::Greater)
        }

        /// Replaces an unset priority with the default of the given range.
        pub fn resolve(&self, setting: &HeadingPrioritySetting) -> Self {
            match self {
                Self::Unset => setting.default,
                p => *p,
            }
        }

        fn context_free(self, other: &Self) -> Self {
            match (self, other) {
                (Self::Unset, Self::Integer(_)) => Self::Integer(NUMERIC_DEFAULT_PRIORITY),
                (Self::Unset, Self::Alpha(_)) => Self::Alpha(ALPHA_DEFAULT_PRIORITY),
                (p, _) => p,
            }
        }
    }

    impl FromStr for HeadingPriority {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let s = s.trim();
            if s.is_empty() {
                return Ok(Self::Unset);
            }
            if s.chars().all(|c| c.is_ascii_digit()) {
                return s
                    .parse::<u8>()
                    .map(Self::Integer)
                    .map_err(|e| format!("invalid numeric priority {s:?}: {e}"));
            }
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => Ok(Self::Alpha(c.to_ascii_uppercase())),
                _ => Err(format!("invalid priority {s:?}")),
            }
        }
    }

    /* ------------------------------ Entities ------------------------------ */

    /// Headline of a node: everything written on the `* ...` line.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Heading {
        /// Number of stars; 0 is reserved for the synthetic document root.
        pub level: u8,

        /// Todo keyword (e.g. TODO, NEXT, DONE) from the buffer's vocabulary.
        pub keyword: Option<String>,

        #[serde(default)]
        pub priority: HeadingPriority,

        /// `COMMENT` headings are excluded, together with their subtree, from agenda output.
        #[serde(default)]
        pub commented: bool,

        pub text: String,

        /// Directly declared tags; display order is kept, membership is what counts.
        #[serde(default)]
        pub tags: IndexSet<Tag>,
    }

    impl Heading {
        pub fn new(level: u8, text: impl Into<String>) -> Self {
            Self {
                level,
                keyword: None,
                priority: HeadingPriority::Unset,
                commented: false,
                text: text.into(),
                tags: IndexSet::new(),
            }
        }

        pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
            self.keyword = Some(keyword.into());
            self
        }

        pub fn with_priority(mut self, priority: HeadingPriority) -> Self {
            self.priority = priority;
            self
        }

        pub fn with_tags<I, T>(mut self, tags: I) -> Self
        where
            I: IntoIterator<Item = T>,
            T: Into<Tag>,
        {
            self.tags.extend(tags.into_iter().map(Into::into));
            self
        }

        pub fn commented(mut self) -> Self {
            self.commented = true;
            self
        }

        pub fn has_tag(&self, tag: &str) -> bool {
            self.tags.iter().any(|t| t.as_str() == tag)
        }
    }

    /// The unit of the outline: a heading plus the content it owns.
    ///
    /// `position` and `document` are maintained by the owning tree and are `None`
    /// for nodes that have not been inserted yet.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Node {
        pub heading: Option<Heading>,

        pub section: Option<Section>,

        #[serde(default)]
        pub properties: PropertyDrawer,

        #[serde(default)]
        pub planning: Vec<Planning>,

        #[serde(skip)]
        pub(crate) position: Option<PositionId>,

        #[serde(skip)]
        pub(crate) document: Option<DocumentId>,
    }

    impl Node {
        pub fn new(heading: Heading) -> Self {
            Self {
                heading: Some(heading),
                ..Self::default()
            }
        }

        pub fn level(&self) -> Option<u8> {
            self.heading.as_ref().map(|h| h.level)
        }

        pub fn title(&self) -> &str {
            self.heading.as_ref().map(|h| h.text.as_str()).unwrap_or("")
        }

        pub fn position(&self) -> Option<PositionId> {
            self.position
        }

        pub fn document(&self) -> Option<DocumentId> {
            self.document
        }

        pub fn is_commented(&self) -> bool {
            self.heading.as_ref().is_some_and(|h| h.commented)
        }

        pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
            self.properties.set(Property::new(key, value));
            self
        }

        pub fn with_planning(mut self, planning: Planning) -> Self {
            self.planning.push(planning);
            self
        }

        pub fn push_element(&mut self, element: Element) {
            self.section.get_or_insert_with(Section::default).elements.push(element);
        }

        pub fn planning_of(&self, kind: PlanningKind) -> Option<&Timing> {
            self.planning
                .iter()
                .find(|p| p.kind == kind)
                .map(|p| &p.timing)
        }

        pub fn scheduled(&self) -> Option<&Timing> {
            self.planning_of(PlanningKind::Scheduled)
        }

        pub fn deadline(&self) -> Option<&Timing> {
            self.planning_of(PlanningKind::Deadline)
        }
    }

    /* ---------------------------- Content Model ---------------------------- */

    /// Content between a heading and the next heading.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Section {
        #[serde(default)]
        pub elements: Vec<Element>,
    }

    /// Section elements. `Raw` keeps lines we do not model so output stays lossless.
    #[non_exhaustive]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Element {
        Paragraph(Vec<String>),
        Drawer(Drawer),
        Clock(ClockEntry),
        Keyword { key: String, value: String },
        Comment(String),
        Raw(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Drawer {
        pub name: String,
        #[serde(default)]
        pub elements: Vec<Element>,
    }

    impl Drawer {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                elements: vec![],
            }
        }

        pub fn add_element(&mut self, element: Element) -> Result<&mut Self, OrgError> {
            if matches!(element, Element::Drawer(_)) {
                return Err(OrgError::NestedDrawer(self.name.clone()));
            }
            self.elements.push(element);
            Ok(self)
        }
    }

    /// `CLOCK:` line; an open clock has no end.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClockEntry {
        pub range: Timestamp,
    }

    impl ClockEntry {
        pub fn duration(&self) -> Duration {
            match self.range.end {
                Some(end) => end - self.range.start,
                None => Duration::zero(),
            }
        }
    }

    /* ------------------------------ Properties ------------------------------ */

    /// Suffix marking a property that lists the allowed values of its base key.
    pub const VALUE_RESTRICTION_SUFFIX: &str = "_ALL";

    pub fn is_restriction_key(key: &str) -> bool {
        let n = key.len();
        let s = VALUE_RESTRICTION_SUFFIX.len();
        n > s
            && key.is_char_boundary(n - s)
            && key[n - s..].eq_ignore_ascii_case(VALUE_RESTRICTION_SUFFIX)
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Property {
        pub key: String,
        pub value: String,
    }

    impl Property {
        pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
            Self {
                key: key.into(),
                value: value.into(),
            }
        }

        pub fn is_value_restriction(&self) -> bool {
            is_restriction_key(&self.key)
        }

        /// Key the restriction applies to (`Color_ALL` → `Color`).
        pub fn restriction_key(&self) -> &str {
            if self.is_value_restriction() {
                &self.key[..self.key.len() - VALUE_RESTRICTION_SUFFIX.len()]
            } else {
                &self.key
            }
        }

        /// Allowed values: whitespace separated, double quotes group values with spaces.
        pub fn restriction_values(&self) -> Vec<String> {
            if !self.is_value_restriction() {
                return vec![];
            }
            split_quoted(&self.value)
        }

        pub fn validate(&self, candidate: &Property) -> Result<(), PropertyError> {
            if !self.is_value_restriction() {
                return Err(PropertyError::NotValueRestriction(self.key.clone()));
            }
            let allowed = self.restriction_values();
            if allowed.iter().any(|v| *v == candidate.value) {
                return Ok(());
            }
            Err(PropertyError::InvalidValue {
                property: candidate.key.clone(),
                value: candidate.value.clone(),
                restrictor: self.key.clone(),
                allowed,
            })
        }
    }

    fn split_quoted(s: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = String::new();
        let mut quoted = false;
        let mut pending = false;
        for c in s.chars() {
            match c {
                '"' => {
                    quoted = !quoted;
                    pending = true;
                }
                c if c.is_whitespace() && !quoted => {
                    if pending || !current.is_empty() {
                        out.push(std::mem::take(&mut current));
                    }
                    pending = false;
                }
                c => current.push(c),
            }
        }
        if pending || !current.is_empty() {
            out.push(current);
        }
        out
    }

    /// Property drawer of a node. Setting an existing key replaces its value in place.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct PropertyDrawer {
        #[serde(default)]
        pub props: IndexMap<String, String>,
    }

    impl PropertyDrawer {
        pub fn is_empty(&self) -> bool {
            self.props.is_empty()
        }

        pub fn len(&self) -> usize {
            self.props.len()
        }

        pub fn set(&mut self, property: Property) -> &mut Self {
            self.props.insert(property.key, property.value);
            self
        }

        /// Property keys are matched case-insensitively, exact spelling first.
        pub fn value(&self, key: &str) -> Option<&str> {
            self.props
                .get(key)
                .or_else(|| {
                    self.props
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(key))
                        .map(|(_, v)| v)
                })
                .map(String::as_str)
        }

        pub fn get(&self, key: &str) -> Option<Property> {
            self.props
                .get_key_value(key)
                .or_else(|| self.props.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)))
                .map(|(k, v)| Property::new(k.clone(), v.clone()))
        }

        /// Removes the entry `get` would return for `key`.
        pub fn remove(&mut self, key: &str) -> Option<Property> {
            let index = self
                .props
                .get_index_of(key)
                .or_else(|| self.props.keys().position(|k| k.eq_ignore_ascii_case(key)))?;
            self.props
                .shift_remove_index(index)
                .map(|(k, v)| Property::new(k, v))
        }

        pub fn iter(&self) -> impl Iterator<Item = Property> + '_ {
            self.props
                .iter()
                .map(|(k, v)| Property::new(k.clone(), v.clone()))
        }

        pub fn value_restrictions(&self) -> Vec<Property> {
            self.iter().filter(Property::is_value_restriction).collect()
        }

        /// The `<key>_ALL` restriction declared in this drawer, if any.
        pub fn restriction_for(&self, key: &str) -> Option<Property> {
            self.iter()
                .find(|p| p.is_value_restriction() && p.restriction_key().eq_ignore_ascii_case(key))
        }

        /// Copy of the properties descendants may inherit under `policy`.
        pub fn heritable(&self, policy: &PropertyInheritance) -> PropertyDrawer {
            let mut out = PropertyDrawer::default();
            for property in self.iter().filter(|p| policy.inherits(&p.key)) {
                out.set(property);
            }
            out
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum PropertyError {
        #[error("property {0} does not declare a value restriction")]
        NotValueRestriction(String),
        #[error(
            "invalid value {value:?} for property {property}: {restrictor} restricts values to: {}",
            .allowed.join(", ")
        )]
        InvalidValue {
            property: String,
            value: String,
            restrictor: String,
            allowed: Vec<String>,
        },
    }

    /// Every failure the library reports, grouped by concern.
    #[derive(Debug, thiserror::Error)]
    pub enum OrgError {
        #[error(transparent)]
        Tree(#[from] crate::tree::TreeError),
        #[error(transparent)]
        Config(#[from] crate::settings::ConfigError),
        #[error(transparent)]
        Property(#[from] PropertyError),
        #[error(transparent)]
        Temporal(#[from] crate::temporal::TemporalError),
        #[error(transparent)]
        Repeat(#[from] crate::repeat::RepeatError),
        #[error("drawer {0} cannot contain another drawer")]
        NestedDrawer(String),
    }

}

pub mod temporal {
    //! Timestamps, ranges and repeat directives.
    //!
    //! All types here are values: helpers take `&self` and hand back a new value, so a
    //! caller can keep the original stamp around after shifting it.

    use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, serde_as};
    use std::str::FromStr;

    /// `+` (shift), `++` (shift into the future, keep alignment), `.+` (from now).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum RepeatKind {
        Shift,
        ShiftFutureFixed,
        ShiftFutureRelative,
    }

    impl RepeatKind {
        pub fn marker(&self) -> &'static str {
            match self {
                Self::Shift => "+",
                Self::ShiftFutureFixed => "++",
                Self::ShiftFutureRelative => ".+",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum IntervalUnit {
        Hour,
        Day,
        Week,
        Month,
        Year,
    }

    impl IntervalUnit {
        pub fn marker(&self) -> char {
            match self {
                Self::Hour => 'h',
                Self::Day => 'd',
                Self::Week => 'w',
                Self::Month => 'm',
                Self::Year => 'y',
            }
        }

        pub fn from_marker(c: char) -> Option<Self> {
            match c {
                'h' => Some(Self::Hour),
                'd' => Some(Self::Day),
                'w' => Some(Self::Week),
                'm' => Some(Self::Month),
                'y' => Some(Self::Year),
                _ => None,
            }
        }

        /// Fixed-length approximation, only meant for visibility windows.
        pub fn approximate(&self, amount: i64) -> Duration {
            match self {
                Self::Hour => Duration::hours(amount),
                Self::Day => Duration::days(amount),
                Self::Week => Duration::weeks(amount),
                Self::Month => Duration::days(30 * amount),
                Self::Year => Duration::days(365 * amount),
            }
        }
    }

    /// Agenda pre-visibility window (`-3d`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct WarningPeriod {
        pub amount: u32,
        pub unit: IntervalUnit,
    }

    impl WarningPeriod {
        pub fn as_duration(&self) -> Duration {
            self.unit.approximate(i64::from(self.amount))
        }
    }

    /// Repeat directive attached to a timestamp (`+1w`, `++1m -3d`, `.+2d`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Repeat {
        pub kind: RepeatKind,
        pub unit: IntervalUnit,
        pub amount: u32,
        pub agenda_window: Option<WarningPeriod>,
    }

    impl Repeat {
        pub fn new(kind: RepeatKind, amount: u32, unit: IntervalUnit) -> Self {
            Self {
                kind,
                unit,
                amount,
                agenda_window: None,
            }
        }

        pub fn with_agenda_window(mut self, amount: u32, unit: IntervalUnit) -> Self {
            self.agenda_window = Some(WarningPeriod { amount, unit });
            self
        }
    }

    impl FromStr for Repeat {
        type Err = TemporalError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            crate::parser::parse_repeat(s.trim())
                .ok_or_else(|| TemporalError::InvalidCookie(s.to_string()))
        }
    }

    /// A point or same-day span in time.
    ///
    /// Date-only stamps keep their start at midnight. `raw_cookie` is the repeat/warning
    /// cookie exactly as it was written and wins over `repeat` when rendering.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Timestamp {
        pub start: NaiveDateTime,
        pub end: Option<NaiveDateTime>,
        #[serde(default)]
        pub date_only: bool,
        pub active: bool,
        #[serde_as(as = "Option<DisplayFromStr>")]
        pub repeat: Option<Repeat>,
        #[serde(default)]
        pub raw_cookie: Option<String>,
    }

    /// Signed length of a range; `valid` is false for point stamps and inverted ranges.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RangeDuration {
        pub duration: Duration,
        pub valid: bool,
    }

    impl RangeDuration {
        fn between(start: NaiveDateTime, end: NaiveDateTime) -> Self {
            let duration = end - start;
            Self {
                duration,
                valid: duration >= Duration::zero(),
            }
        }
    }

    impl Timestamp {
        pub fn new(start: NaiveDateTime) -> Self {
            Self {
                start,
                end: None,
                date_only: false,
                active: true,
                repeat: None,
                raw_cookie: None,
            }
        }

        pub fn on_date(date: NaiveDate) -> Self {
            Self {
                date_only: true,
                ..Self::new(date.and_time(NaiveTime::MIN))
            }
        }

        pub fn with_end(mut self, end: NaiveDateTime) -> Self {
            self.end = Some(end);
            self
        }

        pub fn with_repeat(mut self, repeat: Repeat) -> Self {
            self.raw_cookie = Some(repeat.to_string());
            self.repeat = Some(repeat);
            self
        }

        pub fn inactive(mut self) -> Self {
            self.active = false;
            self
        }

        pub fn as_date_only(mut self) -> Self {
            self.date_only = true;
            self.start = self.start.date().and_time(NaiveTime::MIN);
            self
        }

        pub fn is_range(&self) -> bool {
            self.end.is_some()
        }

        pub fn is_repeating(&self) -> bool {
            self.repeat.is_some()
        }

        pub fn date(&self) -> NaiveDate {
            self.start.date()
        }

        pub fn year(&self) -> i32 {
            self.start.year()
        }

        pub fn month(&self) -> u32 {
            self.start.month()
        }

        pub fn day(&self) -> u32 {
            self.start.day()
        }

        /// Three-letter English day name as written inside Org timestamps.
        pub fn weekday(&self) -> String {
            self.start.format("%a").to_string()
        }

        pub fn time(&self) -> Option<NaiveTime> {
            (!self.date_only).then(|| self.start.time())
        }

        pub fn end_time(&self) -> Option<NaiveTime> {
            if self.date_only {
                return None;
            }
            self.end.map(|e| e.time())
        }

        /// Repeat cookie as written, or rendered from `repeat` when nothing was captured.
        pub fn cookie(&self) -> Option<String> {
            self.raw_cookie
                .clone()
                .or_else(|| self.repeat.map(|r| r.to_string()))
        }

        pub fn duration(&self) -> RangeDuration {
            match self.end {
                Some(end) => RangeDuration::between(self.start, end),
                None => RangeDuration {
                    duration: Duration::zero(),
                    valid: false,
                },
            }
        }

        /// Like `duration`, but an inverted range is an error carrying the negative length.
        pub fn checked_duration(&self) -> Result<Option<Duration>, TemporalError> {
            match self.end {
                None => Ok(None),
                Some(end) if end < self.start => Err(TemporalError::StartAfterEnd {
                    start: self.start,
                    end,
                    duration: end - self.start,
                }),
                Some(end) => Ok(Some(end - self.start)),
            }
        }

        /// True when the start or end instant lies in `[from, to)`.
        pub fn in_window(&self, from: NaiveDateTime, to: NaiveDateTime) -> bool {
            let inside = |t: NaiveDateTime| t >= from && t < to;
            inside(self.start) || self.end.is_some_and(inside)
        }

        pub fn toggle_active(&self) -> Self {
            Self {
                active: !self.active,
                ..self.clone()
            }
        }
    }

    /// Two stamps linked across days: `<2024-07-01 Mon>--<2024-07-10 Wed>`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TimestampRange {
        pub start: Timestamp,
        pub end: Timestamp,
        /// Accept end forms some non-Emacs clients write (see `end_time`).
        #[serde(default)]
        pub compatibility: bool,
    }

    impl TimestampRange {
        pub fn new(start: Timestamp, end: Timestamp) -> Self {
            Self {
                start,
                end,
                compatibility: false,
            }
        }

        pub fn try_new(
            start: Option<Timestamp>,
            end: Option<Timestamp>,
        ) -> Result<Self, TemporalError> {
            match (start, end) {
                (Some(start), Some(end)) => Ok(Self::new(start, end)),
                (None, Some(_)) => Err(TemporalError::NilStart),
                _ => Err(TemporalError::NilTimestamps),
            }
        }

        pub fn with_compatibility(mut self) -> Self {
            self.compatibility = true;
            self
        }

        /// Both sides carry a time range: the same hours on every day of the span.
        pub fn is_date_time_range(&self) -> bool {
            self.start.is_range() && self.end.is_range()
        }

        pub fn is_repeating(&self) -> bool {
            self.start.is_repeating()
        }

        pub fn is_active(&self) -> bool {
            self.start.active
        }

        pub fn time(&self) -> Option<NaiveTime> {
            self.start.time()
        }

        pub fn end_time(&self) -> Option<NaiveTime> {
            if self.end.is_range() {
                return self.end.end_time();
            }
            if self.compatibility {
                if !self.end.date_only {
                    return self.end.time();
                }
                return NaiveTime::from_hms_opt(23, 59, 59);
            }
            self.start.end_time()
        }

        pub fn toggle_active(&self) -> Self {
            let active = !self.start.active;
            Self {
                start: Timestamp {
                    active,
                    ..self.start.clone()
                },
                end: Timestamp {
                    active,
                    ..self.end.clone()
                },
                compatibility: self.compatibility,
            }
        }

        pub fn in_window(&self, from: NaiveDateTime, to: NaiveDateTime) -> bool {
            self.start.in_window(from, to) || self.end.in_window(from, to)
        }

        pub fn last_instant(&self) -> NaiveDateTime {
            self.end.end.unwrap_or(self.end.start)
        }

        pub fn duration(&self) -> RangeDuration {
            RangeDuration::between(self.start.start, self.last_instant())
        }

        pub fn checked_duration(&self) -> Result<Duration, TemporalError> {
            let RangeDuration { duration, valid } = self.duration();
            if valid {
                Ok(duration)
            } else {
                Err(TemporalError::StartAfterEnd {
                    start: self.start.start,
                    end: self.last_instant(),
                    duration,
                })
            }
        }

        /// The whole span as one stamp, carrying the start's flags and cookie.
        pub fn as_span(&self) -> Timestamp {
            Timestamp {
                end: Some(self.last_instant()),
                ..self.start.clone()
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum TimingKind {
        Timestamp,
        Range,
        Sexp,
    }

    /// What a planning entry points at: a stamp, a multi-day range, or a diary sexp.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Timing {
        Timestamp(Timestamp),
        Range(TimestampRange),
        /// Diary expression kept verbatim; it is never evaluated.
        Sexp(String),
    }

    impl Timing {
        pub fn kind(&self) -> TimingKind {
            match self {
                Self::Timestamp(_) => TimingKind::Timestamp,
                Self::Range(_) => TimingKind::Range,
                Self::Sexp(_) => TimingKind::Sexp,
            }
        }

        pub fn in_window(&self, from: NaiveDateTime, to: NaiveDateTime) -> bool {
            match self {
                Self::Timestamp(ts) => ts.in_window(from, to),
                Self::Range(r) => r.in_window(from, to),
                Self::Sexp(_) => false,
            }
        }

        pub fn time(&self) -> Option<NaiveTime> {
            match self {
                Self::Timestamp(ts) => ts.time(),
                Self::Range(r) => r.time(),
                Self::Sexp(_) => None,
            }
        }

        pub fn end_time(&self) -> Option<NaiveTime> {
            match self {
                Self::Timestamp(ts) => ts.end_time(),
                Self::Range(r) => r.end_time(),
                Self::Sexp(_) => None,
            }
        }

        pub fn is_active(&self) -> bool {
            match self {
                Self::Timestamp(ts) => ts.active,
                Self::Range(r) => r.is_active(),
                Self::Sexp(_) => true,
            }
        }

        pub fn is_repeating(&self) -> bool {
            self.start_stamp().is_some_and(Timestamp::is_repeating)
        }

        pub fn start_stamp(&self) -> Option<&Timestamp> {
            match self {
                Self::Timestamp(ts) => Some(ts),
                Self::Range(r) => Some(&r.start),
                Self::Sexp(_) => None,
            }
        }

        /// Single stamp with a same-day time span: `<2024-01-15 Mon 10:00-10:30>`.
        pub fn is_simple_range(&self) -> bool {
            matches!(self, Self::Timestamp(ts) if ts.is_range())
        }

        pub fn is_date_range(&self) -> bool {
            matches!(self, Self::Range(_))
        }

        pub fn is_date_time_range(&self) -> bool {
            matches!(self, Self::Range(r) if r.is_date_time_range())
        }
    }

    impl From<Timestamp> for Timing {
        fn from(ts: Timestamp) -> Self {
            Self::Timestamp(ts)
        }
    }

    impl From<TimestampRange> for Timing {
        fn from(r: TimestampRange) -> Self {
            Self::Range(r)
        }
    }

    /// Role a timestamp plays for its node; agenda visibility rules live with callers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum PlanningKind {
        Event,
        Scheduled,
        Deadline,
        Closed,
    }

    impl PlanningKind {
        pub fn keyword(&self) -> Option<&'static str> {
            match self {
                Self::Event => None,
                Self::Scheduled => Some("SCHEDULED"),
                Self::Deadline => Some("DEADLINE"),
                Self::Closed => Some("CLOSED"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Planning {
        pub kind: PlanningKind,
        pub timing: Timing,
    }

    impl Planning {
        pub fn new(kind: PlanningKind, timing: impl Into<Timing>) -> Self {
            Self {
                kind,
                timing: timing.into(),
            }
        }

        pub fn event(timing: impl Into<Timing>) -> Self {
            Self::new(PlanningKind::Event, timing)
        }

        pub fn scheduled(timing: impl Into<Timing>) -> Self {
            Self::new(PlanningKind::Scheduled, timing)
        }

        pub fn deadline(timing: impl Into<Timing>) -> Self {
            Self::new(PlanningKind::Deadline, timing)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TemporalError {
        #[error("start time [{start}] occurs after end time [{end}]")]
        StartAfterEnd {
            start: NaiveDateTime,
            end: NaiveDateTime,
            duration: Duration,
        },
        #[error("timestamp range requires a start timestamp")]
        NilStart,
        #[error("timestamp range requires both a start and an end timestamp")]
        NilTimestamps,
        #[error("invalid repeat cookie {0:?}")]
        InvalidCookie(String),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, min, 0)
                .unwrap()
        }

        #[test]
        fn inverted_range_reports_negative_duration_without_failing() {
            let range = TimestampRange::new(
                Timestamp::new(at(2024, 3, 10, 12, 0)),
                Timestamp::new(at(2024, 3, 8, 12, 0)),
            );
            let d = range.duration();
            assert!(!d.valid);
            assert_eq!(d.duration, Duration::days(-2));

            match range.checked_duration() {
                Err(TemporalError::StartAfterEnd { duration, .. }) => {
                    assert_eq!(duration, Duration::days(-2))
                }
                other => panic!("expected inverted range error, got {other:?}"),
            }
        }

        #[test]
        fn timestamp_duration_for_point_and_span() {
            let point = Timestamp::new(at(2024, 1, 1, 9, 0));
            assert!(!point.duration().valid);
            assert_eq!(point.checked_duration(), Ok(None));

            let span = point.clone().with_end(at(2024, 1, 1, 10, 30));
            assert_eq!(span.duration().duration, Duration::minutes(90));
            assert!(span.duration().valid);
        }

        #[test]
        fn range_requires_both_ends() {
            let ts = Timestamp::new(at(2024, 1, 1, 9, 0));
            assert_eq!(
                TimestampRange::try_new(None, Some(ts.clone())),
                Err(TemporalError::NilStart)
            );
            assert_eq!(
                TimestampRange::try_new(Some(ts), None),
                Err(TemporalError::NilTimestamps)
            );
            assert_eq!(
                TimestampRange::try_new(None, None),
                Err(TemporalError::NilTimestamps)
            );
        }

        #[test]
        fn window_membership_is_half_open() {
            let ts = Timestamp::new(at(2024, 5, 1, 8, 0));
            assert!(ts.in_window(at(2024, 5, 1, 8, 0), at(2024, 5, 2, 0, 0)));
            assert!(!ts.in_window(at(2024, 4, 30, 0, 0), at(2024, 5, 1, 8, 0)));

            let span = ts.clone().with_end(at(2024, 5, 1, 12, 0));
            assert!(span.in_window(at(2024, 5, 1, 10, 0), at(2024, 5, 1, 13, 0)));
        }

        #[test]
        fn compatibility_end_time_rules() {
            let start = Timestamp::new(at(2024, 1, 1, 9, 0));
            let end_day = Timestamp::on_date(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
            let plain = TimestampRange::new(start.clone(), end_day.clone());
            assert_eq!(plain.end_time(), None);

            let compat = plain.clone().with_compatibility();
            assert_eq!(compat.end_time(), NaiveTime::from_hms_opt(23, 59, 59));

            let timed_end = Timestamp::new(at(2024, 1, 3, 17, 0));
            let compat_timed = TimestampRange::new(start, timed_end).with_compatibility();
            assert_eq!(compat_timed.end_time(), NaiveTime::from_hms_opt(17, 0, 0));
        }

        #[test]
        fn timing_kinds_distinguish_range_shapes() {
            let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
            let simple: Timing = Timestamp::new(at(2024, 1, 15, 10, 0))
                .with_end(at(2024, 1, 15, 10, 30))
                .into();
            assert!(simple.is_simple_range());
            assert!(!simple.is_date_range());

            let days: Timing =
                TimestampRange::new(Timestamp::on_date(day), Timestamp::on_date(day)).into();
            assert_eq!(days.kind(), TimingKind::Range);
            assert!(days.is_date_range());
            assert!(!days.is_date_time_range());

            let sexp = Timing::Sexp("(diary-float t 4 2)".into());
            assert!(!sexp.in_window(at(2000, 1, 1, 0, 0), at(2100, 1, 1, 0, 0)));
            assert_eq!(sexp.time(), None);
        }

        #[test]
        fn toggle_returns_new_value() {
            let original = Timestamp::new(at(2024, 1, 1, 9, 0));
            let toggled = original.toggle_active();
            assert!(original.active);
            assert!(!toggled.active);
        }

        #[test]
        fn with_repeat_records_cookie() {
            let ts = Timestamp::on_date(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap())
                .with_repeat(Repeat::new(RepeatKind::ShiftFutureFixed, 1, IntervalUnit::Month));
            assert_eq!(ts.cookie().as_deref(), Some("++1m"));
            assert_eq!(ts.weekday(), "Wed");
            assert_eq!(ts.time(), None);
        }

        #[test]
        fn repeat_parses_from_cookie_text() {
            let repeat: Repeat = "++2w -3d".parse().expect("cookie");
            assert_eq!(repeat.kind, RepeatKind::ShiftFutureFixed);
            assert_eq!(repeat.amount, 2);
            assert_eq!(repeat.unit, IntervalUnit::Week);
            assert_eq!(
                repeat.agenda_window.map(|w| w.as_duration()),
                Some(Duration::days(3))
            );
            assert!("every week".parse::<Repeat>().is_err());
        }
    }
}

pub mod repeat {
    //! Repeat-shift engine.
    //!
    //! Shifting never mutates: each call wraps a new stamp, so the caller decides whether
    //! to keep the pre-shift value (e.g. for a logbook entry).

    use crate::settings::ConfigError;
    use crate::temporal::{IntervalUnit, Repeat, RepeatKind, Timestamp};
    use chrono::{Datelike, Duration, Local, Months, NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Serialize};
    use tracing::debug;

    /// How month-unit repeats resolve days that do not exist in the next month.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct RepeatConfig {
        pub clamp_to_end_of_month: bool,
        pub shift_by_days: bool,
        pub fixed_date: bool,
    }

    impl RepeatConfig {
        /// Fixed day of month, months lacking that day are skipped.
        pub const DEFAULT: Self = Self {
            clamp_to_end_of_month: false,
            shift_by_days: false,
            fixed_date: true,
        };

        pub fn validate(&self) -> Result<(), ConfigError> {
            if self.shift_by_days && self.fixed_date {
                return Err(ConfigError::ExclusiveRepeatPolicies);
            }
            Ok(())
        }
    }

    impl Default for RepeatConfig {
        fn default() -> Self {
            Self::DEFAULT
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum RepeatError {
        #[error("timestamp has no repeat directive")]
        MissingRepeat,
        #[error(transparent)]
        InvalidConfig(#[from] ConfigError),
        #[error("repeat interval {0} does not move the timestamp forward")]
        NonAdvancing(String),
        #[error("shifted timestamp falls outside the supported calendar")]
        OutOfRange,
    }

    /// Shift operations over repeating timestamps.
    pub trait Repeater: Sized {
        /// One shift following the repeat kind; `reference` defaults to the local clock.
        fn shift(&self, reference: Option<NaiveDateTime>) -> Result<Self, RepeatError>;

        /// `n` plain shifts of the repeat interval, regardless of kind.
        fn shift_n(&self, n: u32) -> Result<Self, RepeatError>;

        /// Latest occurrence starting at or before `target`; `self` if it starts after it.
        fn shift_until(&self, target: NaiveDateTime) -> Result<Self, RepeatError>;

        /// Earliest occurrence strictly after `target`, at least one shift away.
        fn shift_until_after(&self, target: NaiveDateTime) -> Result<Self, RepeatError>;
    }

    /// A timestamp bound to the month policy it repeats under.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RepeatStamp {
        pub stamp: Timestamp,
        pub config: RepeatConfig,
    }

    impl RepeatStamp {
        pub fn new(stamp: Timestamp, config: RepeatConfig) -> Self {
            Self { stamp, config }
        }

        pub fn start(&self) -> NaiveDateTime {
            self.stamp.start
        }

        pub fn into_inner(self) -> Timestamp {
            self.stamp
        }

        fn repeat(&self) -> Result<&Repeat, RepeatError> {
            self.stamp.repeat.as_ref().ok_or(RepeatError::MissingRepeat)
        }

        fn with_stamp(&self, stamp: Timestamp) -> Self {
            Self {
                stamp,
                config: self.config,
            }
        }

        /// Step index and occurrence of the latest start at or before `target`.
        /// Index 0 is the stamp itself, also returned when it starts after `target`.
        pub(crate) fn locate(&self, target: NaiveDateTime) -> Result<(u32, Self), RepeatError> {
            if self.stamp.start > target {
                return Ok((0, self.clone()));
            }
            let first = self.shift_n(1)?;
            let delta = first.stamp.start - self.stamp.start;
            if delta <= Duration::zero() {
                let cookie = self.stamp.cookie().unwrap_or_default();
                return Err(RepeatError::NonAdvancing(cookie));
            }
            if first.stamp.start > target {
                return Ok((0, self.clone()));
            }

            // Occurrence k is always derived from the origin, never from a previous result,
            // so month clamping cannot compound across probes.
            let elapsed = (target - self.stamp.start).num_seconds();
            let estimate = elapsed / delta.num_seconds().max(1);
            let mut low: u32 = 1;
            let mut low_stamp = first;
            let mut high: Option<u32> = None;
            let mut probe = u32::try_from(estimate).unwrap_or(u32::MAX).max(1);
            loop {
                if probe > low {
                    let candidate = self.shift_n(probe)?;
                    if candidate.stamp.start > target {
                        high = Some(probe);
                    } else {
                        low = probe;
                        low_stamp = candidate;
                    }
                }
                match high {
                    Some(h) if h - low <= 1 => return Ok((low, low_stamp)),
                    Some(h) => probe = low + (h - low) / 2,
                    None => {
                        let next = self.shift_n(low + 1)?;
                        if next.stamp.start > target {
                            return Ok((low, low_stamp));
                        }
                        low += 1;
                        low_stamp = next;
                        probe = low;
                    }
                }
            }
        }
    }

    impl From<Timestamp> for RepeatStamp {
        fn from(stamp: Timestamp) -> Self {
            Self::new(stamp, RepeatConfig::DEFAULT)
        }
    }

    impl Repeater for RepeatStamp {
        fn shift(&self, reference: Option<NaiveDateTime>) -> Result<Self, RepeatError> {
            let repeat = *self.repeat()?;
            let shifted = match repeat.kind {
                RepeatKind::Shift => self.shift_n(1)?,
                RepeatKind::ShiftFutureFixed => {
                    self.shift_until_after(reference.unwrap_or_else(now))?
                }
                RepeatKind::ShiftFutureRelative => {
                    let reference = reference.unwrap_or_else(now);
                    let start = if self.stamp.date_only {
                        reference.date().and_time(NaiveTime::MIN)
                    } else {
                        reference
                    };
                    let end = match self.stamp.end {
                        Some(end) => Some(add(start, end - self.stamp.start)?),
                        None => None,
                    };
                    let anchored = self.with_stamp(Timestamp {
                        start,
                        end,
                        ..self.stamp.clone()
                    });
                    anchored.shift_n(1)?
                }
            };
            debug!(
                kind = repeat.kind.marker(),
                from = %self.stamp.start,
                to = %shifted.stamp.start,
                "shifted repeating timestamp"
            );
            Ok(shifted)
        }

        fn shift_n(&self, n: u32) -> Result<Self, RepeatError> {
            let repeat = *self.repeat()?;
            let steps = i64::from(repeat.amount) * i64::from(n);
            let stamp = &self.stamp;
            let shifted = match repeat.unit {
                IntervalUnit::Hour => {
                    let delta = Duration::try_hours(steps).ok_or(RepeatError::OutOfRange)?;
                    let mut out = shift_linear(stamp, delta)?;
                    out.date_only = false;
                    out
                }
                IntervalUnit::Day => {
                    shift_linear(stamp, Duration::try_days(steps).ok_or(RepeatError::OutOfRange)?)?
                }
                IntervalUnit::Week => {
                    shift_linear(stamp, Duration::try_weeks(steps).ok_or(RepeatError::OutOfRange)?)?
                }
                IntervalUnit::Month => {
                    self.config.validate()?;
                    let mut out = stamp.clone();
                    for _ in 0..steps {
                        out = month_step(&out, &self.config)?;
                    }
                    out
                }
                IntervalUnit::Year => {
                    let months = u32::try_from(steps * 12).map_err(|_| RepeatError::OutOfRange)?;
                    let months = Months::new(months);
                    let mut out = stamp.clone();
                    out.start = stamp
                        .start
                        .checked_add_months(months)
                        .ok_or(RepeatError::OutOfRange)?;
                    out.end = match stamp.end {
                        Some(end) => Some(end.checked_add_months(months).ok_or(RepeatError::OutOfRange)?),
                        None => None,
                    };
                    out
                }
            };
            Ok(self.with_stamp(shifted))
        }

        fn shift_until(&self, target: NaiveDateTime) -> Result<Self, RepeatError> {
            Ok(self.locate(target)?.1)
        }

        fn shift_until_after(&self, target: NaiveDateTime) -> Result<Self, RepeatError> {
            let (mut k, _) = self.locate(target)?;
            loop {
                k = k.checked_add(1).ok_or(RepeatError::OutOfRange)?;
                let after = self.shift_n(k)?;
                if after.stamp.start > target {
                    return Ok(after);
                }
            }
        }
    }

    fn now() -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn add(t: NaiveDateTime, delta: Duration) -> Result<NaiveDateTime, RepeatError> {
        t.checked_add_signed(delta).ok_or(RepeatError::OutOfRange)
    }

    fn shift_linear(stamp: &Timestamp, delta: Duration) -> Result<Timestamp, RepeatError> {
        let mut out = stamp.clone();
        out.start = add(stamp.start, delta)?;
        out.end = match stamp.end {
            Some(end) => Some(add(end, delta)?),
            None => None,
        };
        Ok(out)
    }

    fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
        let (year, month) = if date.month() == 12 {
            (date.year() + 1, 1)
        } else {
            (date.year(), date.month() + 1)
        };
        NaiveDate::from_ymd_opt(year, month, 1)
    }

    pub(crate) fn last_of_month(date: NaiveDate) -> NaiveDate {
        first_of_next_month(date)
            .and_then(|d| d.pred_opt())
            .unwrap_or(date)
    }

    fn months_between(from: NaiveDate, to: NaiveDate) -> i32 {
        (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32
    }

    /// One month forward under `config`.
    fn month_step(stamp: &Timestamp, config: &RepeatConfig) -> Result<Timestamp, RepeatError> {
        let start = stamp.start;
        let next_first = first_of_next_month(start.date()).ok_or(RepeatError::OutOfRange)?;
        let next_last = last_of_month(next_first);
        let mut out = stamp.clone();

        match (
            config.clamp_to_end_of_month,
            config.shift_by_days,
            config.fixed_date,
        ) {
            (true, false, false) => {
                out.start = next_last.and_time(start.time());
                out.end = match stamp.end {
                    Some(end) => {
                        let first = first_of_next_month(end.date()).ok_or(RepeatError::OutOfRange)?;
                        Some(last_of_month(first).and_time(end.time()))
                    }
                    None => None,
                };
            }
            (true, true, _) => {
                let shifted = add(start, Duration::days(30))?;
                let resolved = if months_between(start.date(), shifted.date()) > 1 {
                    next_last.and_time(start.time())
                } else {
                    shifted
                };
                out.start = resolved;
                out.end = stamp.end.map(|end| resolved.date().and_time(end.time()));
            }
            (true, false, true) => {
                let day = start.day().min(next_last.day());
                let date = next_first.with_day(day).ok_or(RepeatError::OutOfRange)?;
                out.start = date.and_time(start.time());
                out.end = stamp.end.map(|end| date.and_time(end.time()));
            }
            (false, true, _) => {
                out = shift_linear(stamp, Duration::days(30))?;
            }
            (false, false, true) => {
                let mut first = next_first;
                while last_of_month(first).day() < start.day() {
                    first = first_of_next_month(first).ok_or(RepeatError::OutOfRange)?;
                }
                let date = first.with_day(start.day()).ok_or(RepeatError::OutOfRange)?;
                out.start = date.and_time(start.time());
                out.end = stamp.end.map(|end| date.and_time(end.time()));
            }
            (false, false, false) => {
                let month = Months::new(1);
                out.start = start.checked_add_months(month).ok_or(RepeatError::OutOfRange)?;
                out.end = match stamp.end {
                    Some(end) => Some(end.checked_add_months(month).ok_or(RepeatError::OutOfRange)?),
                    None => None,
                };
            }
        }
        Ok(out)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::temporal::Repeat;

        fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, min, 0)
                .unwrap()
        }

        fn stamp(start: NaiveDateTime, kind: RepeatKind, amount: u32, unit: IntervalUnit) -> RepeatStamp {
            RepeatStamp::from(Timestamp::new(start).with_repeat(Repeat::new(kind, amount, unit)))
        }

        #[test]
        fn future_fixed_lands_on_first_occurrence_after_reference() {
            let reference = Some(at(2020, 1, 1, 12, 0));
            let start = at(2020, 1, 1, 8, 30);
            let cases = [
                (IntervalUnit::Hour, at(2020, 1, 1, 14, 30)),
                (IntervalUnit::Day, at(2020, 1, 7, 8, 30)),
                (IntervalUnit::Week, at(2020, 2, 12, 8, 30)),
            ];
            for (unit, expected) in cases {
                let shifted = stamp(start, RepeatKind::ShiftFutureFixed, 6, unit)
                    .shift(reference)
                    .unwrap();
                assert_eq!(shifted.start(), expected, "unit {unit:?}");
            }
        }

        #[test]
        fn plain_shift_moves_exactly_one_interval() {
            let base = stamp(at(2024, 1, 1, 9, 0), RepeatKind::Shift, 3, IntervalUnit::Day);
            let shifted = base.shift(Some(at(2030, 1, 1, 0, 0))).unwrap();
            assert_eq!(shifted.start(), at(2024, 1, 4, 9, 0));
            // The source value is untouched.
            assert_eq!(base.start(), at(2024, 1, 1, 9, 0));
        }

        #[test]
        fn relative_shift_counts_from_reference_and_keeps_duration() {
            let ts = Timestamp::new(at(2024, 1, 1, 9, 0))
                .with_end(at(2024, 1, 1, 10, 0))
                .with_repeat(Repeat::new(RepeatKind::ShiftFutureRelative, 2, IntervalUnit::Day));
            let shifted = RepeatStamp::from(ts).shift(Some(at(2024, 3, 5, 18, 15))).unwrap();
            assert_eq!(shifted.start(), at(2024, 3, 7, 18, 15));
            assert_eq!(shifted.stamp.end, Some(at(2024, 3, 7, 19, 15)));
        }

        #[test]
        fn clamped_fixed_date_drifts_after_short_month() {
            let config = RepeatConfig {
                clamp_to_end_of_month: true,
                shift_by_days: false,
                fixed_date: true,
            };
            let ts = Timestamp::new(at(2023, 1, 31, 9, 0))
                .with_repeat(Repeat::new(RepeatKind::Shift, 1, IntervalUnit::Month));
            let once = RepeatStamp::new(ts, config).shift_n(1).unwrap();
            assert_eq!(once.start(), at(2023, 2, 28, 9, 0));
            let twice = once.shift_n(1).unwrap();
            assert_eq!(twice.start(), at(2023, 3, 28, 9, 0));
        }

        #[test]
        fn fixed_date_skips_months_without_the_day() {
            let ts = Timestamp::new(at(2023, 1, 31, 9, 0))
                .with_repeat(Repeat::new(RepeatKind::Shift, 1, IntervalUnit::Month));
            let next = RepeatStamp::from(ts).shift_n(1).unwrap();
            assert_eq!(next.start(), at(2023, 3, 31, 9, 0));
        }

        #[test]
        fn clamp_only_lands_on_last_day_of_next_month() {
            let config = RepeatConfig {
                clamp_to_end_of_month: true,
                shift_by_days: false,
                fixed_date: false,
            };
            let ts = Timestamp::new(at(2024, 1, 10, 7, 45))
                .with_repeat(Repeat::new(RepeatKind::Shift, 1, IntervalUnit::Month));
            let next = RepeatStamp::new(ts, config).shift_n(1).unwrap();
            assert_eq!(next.start(), at(2024, 2, 29, 7, 45));
        }

        #[test]
        fn clamp_with_day_shift_stays_in_following_month() {
            let config = RepeatConfig {
                clamp_to_end_of_month: true,
                shift_by_days: true,
                fixed_date: false,
            };
            let ts = Timestamp::new(at(2023, 1, 31, 9, 0))
                .with_repeat(Repeat::new(RepeatKind::Shift, 1, IntervalUnit::Month));
            let next = RepeatStamp::new(ts.clone(), config).shift_n(1).unwrap();
            assert_eq!(next.start(), at(2023, 2, 28, 9, 0));

            let unclamped = RepeatConfig {
                clamp_to_end_of_month: false,
                ..config
            };
            let next = RepeatStamp::new(ts, unclamped).shift_n(1).unwrap();
            assert_eq!(next.start(), at(2023, 3, 2, 9, 0));
        }

        #[test]
        fn exclusive_month_policies_are_rejected() {
            let config = RepeatConfig {
                clamp_to_end_of_month: false,
                shift_by_days: true,
                fixed_date: true,
            };
            let ts = Timestamp::new(at(2024, 1, 1, 9, 0))
                .with_repeat(Repeat::new(RepeatKind::Shift, 1, IntervalUnit::Month));
            assert_eq!(
                RepeatStamp::new(ts, config).shift_n(1),
                Err(RepeatError::InvalidConfig(ConfigError::ExclusiveRepeatPolicies))
            );
        }

        #[test]
        fn shift_until_finds_latest_occurrence_not_after_target() {
            let base = stamp(at(2024, 1, 1, 9, 0), RepeatKind::Shift, 1, IntervalUnit::Week);
            let found = base.shift_until(at(2024, 3, 1, 0, 0)).unwrap();
            assert_eq!(found.start(), at(2024, 2, 26, 9, 0));

            let exact = base.shift_until(at(2024, 1, 15, 9, 0)).unwrap();
            assert_eq!(exact.start(), at(2024, 1, 15, 9, 0));

            let future = base.shift_until(at(2023, 6, 1, 0, 0)).unwrap();
            assert_eq!(future, base);
        }

        #[test]
        fn shift_until_over_months_matches_step_by_step() {
            let base = stamp(at(2020, 1, 31, 9, 0), RepeatKind::Shift, 1, IntervalUnit::Month);
            let found = base.shift_until(at(2021, 1, 1, 0, 0)).unwrap();
            // Fixed-date policy: only months with a 31st qualify.
            assert_eq!(found.start(), at(2020, 12, 31, 9, 0));
        }

        #[test]
        fn shift_until_after_is_strict() {
            let base = stamp(at(2024, 1, 1, 9, 0), RepeatKind::Shift, 1, IntervalUnit::Day);
            let after = base.shift_until_after(at(2024, 1, 5, 9, 0)).unwrap();
            assert_eq!(after.start(), at(2024, 1, 6, 9, 0));
        }

        #[test]
        fn leap_day_yearly_repeat_counts_from_origin() {
            let base = stamp(at(2024, 2, 29, 9, 0), RepeatKind::Shift, 1, IntervalUnit::Year);
            let fourth = base.shift_n(4).unwrap();
            assert_eq!(fourth.start(), at(2028, 2, 29, 9, 0));

            let after = base.shift_until_after(at(2027, 6, 1, 0, 0)).unwrap();
            assert_eq!(after, fourth);
            assert_eq!(base.shift_until(at(2028, 3, 1, 0, 0)).unwrap(), fourth);
            let first = base.shift_until_after(at(2025, 1, 1, 0, 0)).unwrap();
            assert_eq!(first.start(), at(2025, 2, 28, 9, 0));
        }

        #[test]
        fn zero_interval_is_rejected() {
            let base = stamp(at(2024, 1, 1, 9, 0), RepeatKind::Shift, 0, IntervalUnit::Day);
            assert!(matches!(
                base.shift_until(at(2024, 2, 1, 0, 0)),
                Err(RepeatError::NonAdvancing(_))
            ));
        }

        #[test]
        fn hour_shift_of_date_only_stamp_gains_a_time() {
            let ts = Timestamp::on_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
                .with_repeat(Repeat::new(RepeatKind::Shift, 6, IntervalUnit::Hour));
            let next = RepeatStamp::from(ts).shift_n(1).unwrap();
            assert_eq!(next.start(), at(2024, 1, 1, 6, 0));
            assert!(!next.stamp.date_only);
        }

        #[test]
        fn year_shift_clamps_leap_day() {
            let base = stamp(at(2024, 2, 29, 9, 0), RepeatKind::Shift, 1, IntervalUnit::Year);
            assert_eq!(base.shift_n(1).unwrap().start(), at(2025, 2, 28, 9, 0));
            assert_eq!(base.shift_n(4).unwrap().start(), at(2028, 2, 29, 9, 0));
        }

        #[test]
        fn missing_repeat_is_an_error() {
            let plain = RepeatStamp::from(Timestamp::new(at(2024, 1, 1, 9, 0)));
            assert_eq!(plain.shift_n(1), Err(RepeatError::MissingRepeat));
        }
    }
}

pub mod settings {
    //! Buffer-level configuration: todo vocabulary, priority range, inheritance policy.

    use crate::core::{HeadingPriority, HeadingPriorityKind, PropertyDrawer, Tag, is_restriction_key};
    use crate::repeat::RepeatConfig;
    use indexmap::{IndexMap, IndexSet};
    use serde::{Deserialize, Serialize};
    use std::{cmp::Ordering, collections::HashSet, str::FromStr};

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ConfigError {
        #[error("invalid repeat config: shift-by-days and fixed-date are mutually exclusive")]
        ExclusiveRepeatPolicies,
        #[error("unknown todo sequence kind {0:?}")]
        UnknownSequenceKind(String),
        #[error("todo sequence declares no keywords")]
        EmptySequence,
        #[error("todo keyword collision: {0} is already declared")]
        KeywordCollision(String),
        #[error("todo fast-access key collision: {key:?} is already bound to {existing}")]
        FastKeyCollision { key: char, existing: String },
        #[error("priority range must use one kind throughout (got {highest}, {lowest}, {default})")]
        PriorityKindMismatch {
            highest: HeadingPriority,
            lowest: HeadingPriority,
            default: HeadingPriority,
        },
        #[error("priority {priority} lies outside the range {highest}..{lowest}")]
        PriorityOutOfRange {
            priority: HeadingPriority,
            highest: HeadingPriority,
            lowest: HeadingPriority,
        },
    }

    /* ------------------------------ Todo ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TodoKeyword {
        pub name: String,
        pub fast_key: Option<char>,
    }

    impl TodoKeyword {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                fast_key: None,
            }
        }

        /// Parses `NEXT`, `NEXT(n)` or `WAIT(w@/!)`. Logging markers after the key are dropped.
        pub fn parse(item: &str) -> Self {
            match item.split_once('(') {
                Some((name, rest)) => Self {
                    name: name.to_string(),
                    fast_key: rest
                        .trim_end_matches(')')
                        .chars()
                        .next()
                        .filter(|c| c.is_alphanumeric()),
                },
                None => Self::new(item),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum TodoSequenceKind {
        /// Keywords name a type of task; cycling jumps straight to done.
        Type,
        /// Keywords are successive states of one workflow.
        State,
    }

    impl TodoSequenceKind {
        pub fn directive(&self) -> &'static str {
            match self {
                Self::Type => "TYP_TODO",
                Self::State => "TODO",
            }
        }
    }

    impl FromStr for TodoSequenceKind {
        type Err = ConfigError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s.to_ascii_uppercase().as_str() {
                "TYP_TODO" | "TYPE" => Ok(Self::Type),
                "TODO" | "SEQ_TODO" | "STATE" => Ok(Self::State),
                _ => Err(ConfigError::UnknownSequenceKind(s.to_string())),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum TodoState {
        Active,
        Done,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoSequence {
        pub kind: TodoSequenceKind,
        pub active: Vec<TodoKeyword>,
        pub done: Vec<TodoKeyword>,
    }

    impl TodoSequence {
        /// Builds a sequence from directive items; `|` splits active from done,
        /// without it the last keyword is the only done state.
        pub fn from_items<S: AsRef<str>>(kind: TodoSequenceKind, items: &[S]) -> Result<Self, ConfigError> {
            let items: Vec<&str> = items
                .iter()
                .map(AsRef::as_ref)
                .filter(|s| !s.is_empty())
                .collect();
            let (active, done): (&[&str], &[&str]) = match items.iter().position(|i| *i == "|") {
                Some(idx) => (&items[..idx], &items[idx + 1..]),
                None => match items.split_last() {
                    Some((last, rest)) => (rest, std::slice::from_ref(last)),
                    None => return Err(ConfigError::EmptySequence),
                },
            };
            if active.is_empty() && done.is_empty() {
                return Err(ConfigError::EmptySequence);
            }
            Ok(Self {
                kind,
                active: active.iter().map(|s| TodoKeyword::parse(s)).collect(),
                done: done.iter().map(|s| TodoKeyword::parse(s)).collect(),
            })
        }

        pub fn keywords(&self) -> impl Iterator<Item = &TodoKeyword> {
            self.active.iter().chain(self.done.iter())
        }

        pub fn state_of(&self, keyword: &str) -> Option<TodoState> {
            if self.active.iter().any(|k| k.name == keyword) {
                Some(TodoState::Active)
            } else if self.done.iter().any(|k| k.name == keyword) {
                Some(TodoState::Done)
            } else {
                None
            }
        }
    }

    /// Todo vocabulary of a buffer. Keywords and fast keys are unique across sequences.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TodoSettings {
        #[serde(default)]
        sequences: Vec<TodoSequence>,
    }

    impl TodoSettings {
        /// The stock `TODO | DONE` vocabulary.
        pub fn standard() -> Self {
            Self {
                sequences: vec![TodoSequence {
                    kind: TodoSequenceKind::State,
                    active: vec![TodoKeyword::new("TODO")],
                    done: vec![TodoKeyword::new("DONE")],
                }],
            }
        }

        pub fn add(&mut self, sequence: TodoSequence) -> Result<&mut Self, ConfigError> {
            let mut names = HashSet::new();
            let mut keys = HashSet::new();
            for keyword in sequence.keywords() {
                if self.state_of(&keyword.name).is_some() || !names.insert(keyword.name.as_str()) {
                    return Err(ConfigError::KeywordCollision(keyword.name.clone()));
                }
                if let Some(key) = keyword.fast_key {
                    if let Some(existing) = self.by_fast_key(key) {
                        return Err(ConfigError::FastKeyCollision {
                            key,
                            existing: existing.to_string(),
                        });
                    }
                    if !keys.insert(key) {
                        return Err(ConfigError::FastKeyCollision {
                            key,
                            existing: keyword.name.clone(),
                        });
                    }
                }
            }
            self.sequences.push(sequence);
            Ok(self)
        }

        pub fn clear(&mut self) {
            self.sequences.clear();
        }

        pub fn sequences(&self) -> &[TodoSequence] {
            &self.sequences
        }

        pub fn state_of(&self, keyword: &str) -> Option<TodoState> {
            self.sequences.iter().find_map(|s| s.state_of(keyword))
        }

        pub fn is_keyword(&self, keyword: &str) -> bool {
            self.state_of(keyword).is_some()
        }

        pub fn is_done(&self, keyword: &str) -> bool {
            self.state_of(keyword) == Some(TodoState::Done)
        }

        pub fn by_fast_key(&self, key: char) -> Option<&str> {
            self.sequences
                .iter()
                .flat_map(TodoSequence::keywords)
                .find(|k| k.fast_key == Some(key))
                .map(|k| k.name.as_str())
        }

        /// Keyword that follows `current` when cycling; `None` clears the keyword.
        pub fn next_keyword(&self, current: Option<&str>) -> Option<&str> {
            let Some(current) = current else {
                return self
                    .sequences
                    .first()
                    .and_then(|s| s.keywords().next())
                    .map(|k| k.name.as_str());
            };
            let sequence = self.sequences.iter().find(|s| s.state_of(current).is_some())?;
            if sequence.kind == TodoSequenceKind::Type && sequence.state_of(current) == Some(TodoState::Active) {
                return sequence.done.first().map(|k| k.name.as_str());
            }
            let mut keywords = sequence.keywords().skip_while(|k| k.name != current);
            keywords.next();
            keywords.next().map(|k| k.name.as_str())
        }
    }

    /* ---------------------------- Priorities ---------------------------- */

    /// Allowed priority range. `highest` is the most significant value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HeadingPrioritySetting {
        pub highest: HeadingPriority,
        pub lowest: HeadingPriority,
        pub default: HeadingPriority,
    }

    impl HeadingPrioritySetting {
        pub const fn alpha() -> Self {
            Self {
                highest: HeadingPriority::Alpha('A'),
                lowest: HeadingPriority::Alpha('C'),
                default: HeadingPriority::Alpha('B'),
            }
        }

        pub const fn numeric() -> Self {
            Self {
                highest: HeadingPriority::Integer(1),
                lowest: HeadingPriority::Integer(64),
                default: HeadingPriority::Integer(32),
            }
        }

        pub fn kind(&self) -> Option<HeadingPriorityKind> {
            self.highest.kind()
        }

        pub fn validate(&self) -> Result<(), ConfigError> {
            let kind = self.highest.kind();
            if kind.is_none() || self.lowest.kind() != kind || self.default.kind() != kind {
                return Err(ConfigError::PriorityKindMismatch {
                    highest: self.highest,
                    lowest: self.lowest,
                    default: self.default,
                });
            }
            self.check(&self.lowest)?;
            self.check(&self.default)
        }

        /// Unset priorities always fit.
        pub fn contains(&self, priority: &HeadingPriority) -> bool {
            if !priority.is_set() {
                return true;
            }
            let at_least = |a: &HeadingPriority, b: &HeadingPriority| {
                matches!(a.significance_cmp(b), Some(Ordering::Greater | Ordering::Equal))
            };
            at_least(&self.highest, priority) && at_least(priority, &self.lowest)
        }

        pub fn check(&self, priority: &HeadingPriority) -> Result<(), ConfigError> {
            if self.contains(priority) {
                return Ok(());
            }
            Err(ConfigError::PriorityOutOfRange {
                priority: *priority,
                highest: self.highest,
                lowest: self.lowest,
            })
        }
    }

    impl Default for HeadingPrioritySetting {
        fn default() -> Self {
            Self::alpha()
        }
    }

    /* ---------------------------- Inheritance ---------------------------- */

    /// Which ancestor tags flow down. `include` only matters when `inherit_all` is off.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TagInheritance {
        pub inherit_all: bool,
        #[serde(default)]
        pub include: Vec<String>,
        #[serde(default)]
        pub exclude: Vec<String>,
    }

    impl TagInheritance {
        pub fn admits(&self, tag: &Tag) -> bool {
            let listed = |list: &[String]| list.iter().any(|t| t == tag.as_str());
            if self.inherit_all {
                !listed(&self.exclude)
            } else {
                listed(&self.include)
            }
        }
    }

    impl Default for TagInheritance {
        fn default() -> Self {
            Self {
                inherit_all: true,
                include: vec![],
                exclude: vec![],
            }
        }
    }

    /// Which properties descendants see. Value restrictions (`*_ALL`) are always inherited.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum PropertyInheritance {
        #[default]
        None,
        All,
        Keys(Vec<String>),
    }

    impl PropertyInheritance {
        pub fn inherits(&self, key: &str) -> bool {
            if is_restriction_key(key) {
                return true;
            }
            match self {
                Self::None => false,
                Self::All => true,
                Self::Keys(keys) => keys.iter().any(|k| k.eq_ignore_ascii_case(key)),
            }
        }
    }

    /* ------------------------------ Buffer ------------------------------ */

    /// Per-document settings, mostly filled from `#+KEY:` lines.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BufferSettings {
        pub title: Option<String>,
        #[serde(default)]
        pub file_tags: IndexSet<Tag>,
        /// `#+PROPERTY:` values, visible to every heading.
        #[serde(default)]
        pub properties: PropertyDrawer,
        pub category: Option<String>,
        pub archive: Option<String>,
        pub columns: Option<String>,
        #[serde(default)]
        pub constants: IndexMap<String, String>,
        #[serde(default)]
        pub links: IndexMap<String, String>,
        #[serde(default)]
        pub priorities: HeadingPrioritySetting,
        #[serde(default = "TodoSettings::standard")]
        pub todo: TodoSettings,
        #[serde(default)]
        pub repeat: RepeatConfig,
        #[serde(default)]
        pub tag_inheritance: TagInheritance,
        #[serde(default)]
        pub property_inheritance: PropertyInheritance,
    }

    impl Default for BufferSettings {
        fn default() -> Self {
            Self {
                title: None,
                file_tags: IndexSet::new(),
                properties: PropertyDrawer::default(),
                category: None,
                archive: None,
                columns: None,
                constants: IndexMap::new(),
                links: IndexMap::new(),
                priorities: HeadingPrioritySetting::default(),
                todo: TodoSettings::standard(),
                repeat: RepeatConfig::DEFAULT,
                tag_inheritance: TagInheritance::default(),
                property_inheritance: PropertyInheritance::default(),
            }
        }
    }

    impl BufferSettings {
        pub fn validate(&self) -> Result<(), ConfigError> {
            self.priorities.validate()?;
            self.repeat.validate()
        }
    }

}

pub mod tree {
    //! Depth-keyed outline tree.
    //!
    //! Positions live in an arena and refer to each other by `PositionId`. A position owns
    //! its ordered children; the parent link is a plain back-reference used for the upward
    //! walks (`walk_back_to_level`, tag inheritance). Level 0 belongs to the synthetic root
    //! alone, every other position carries a heading and sits deeper than its parent.

    use crate::core::{DocumentId, Node, Tag};
    use indexmap::{IndexMap, IndexSet};
    use serde::{Deserialize, Serialize};
    use std::{collections::HashMap, fmt};
    use tracing::debug;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PositionId(usize);

    impl PositionId {
        pub fn index(self) -> usize {
            self.0
        }
    }

    impl fmt::Display for PositionId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "#{}", self.0)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TreeError {
        #[error("heading level {0} is invalid; headings start at level 1")]
        InvalidLevel(u8),
        #[error("only nodes with a heading can be placed in the outline")]
        MissingHeading,
        #[error("no position accepts a heading at level {0}")]
        UnknownInsert(u8),
        #[error("position {0} does not exist in this outline")]
        UnknownPosition(PositionId),
        #[error("the outline root cannot be detached")]
        DetachRoot,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Position {
        node: Node,
        parent: Option<PositionId>,
        children: Vec<PositionId>,
    }

    const ROOT: PositionId = PositionId(0);

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OutlineTree {
        slots: Vec<Option<Position>>,
        #[serde(skip)]
        document: Option<DocumentId>,
    }

    impl Default for OutlineTree {
        fn default() -> Self {
            Self::new()
        }
    }

    impl OutlineTree {
        pub fn new() -> Self {
            let mut root = Node::default();
            root.position = Some(ROOT);
            Self {
                slots: vec![Some(Position {
                    node: root,
                    parent: None,
                    children: vec![],
                })],
                document: None,
            }
        }

        pub(crate) fn for_document(document: DocumentId) -> Self {
            let mut tree = Self::new();
            tree.document = Some(document);
            tree.live_mut(ROOT).node.document = Some(document);
            tree
        }

        pub fn root(&self) -> PositionId {
            ROOT
        }

        pub fn contains(&self, id: PositionId) -> bool {
            self.slot(id).is_some()
        }

        /// Number of headings, the root excluded.
        pub fn len(&self) -> usize {
            self.slots.iter().flatten().count() - 1
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        fn slot(&self, id: PositionId) -> Option<&Position> {
            self.slots.get(id.0).and_then(Option::as_ref)
        }

        fn live(&self, id: PositionId) -> &Position {
            self.slot(id)
                .unwrap_or_else(|| panic!("outline position {id} is not live"))
        }

        fn live_mut(&mut self, id: PositionId) -> &mut Position {
            self.slots
                .get_mut(id.0)
                .and_then(Option::as_mut)
                .unwrap_or_else(|| panic!("outline position {id} is not live"))
        }

        pub fn node(&self, id: PositionId) -> Option<&Node> {
            self.slot(id).map(|p| &p.node)
        }

        /// Mutable access to a node. Changing the heading level here bypasses the
        /// ordering checks of `insert_heading`.
        pub fn node_mut(&mut self, id: PositionId) -> Option<&mut Node> {
            self.slots
                .get_mut(id.0)
                .and_then(Option::as_mut)
                .map(|p| &mut p.node)
        }

        pub fn parent(&self, id: PositionId) -> Option<PositionId> {
            self.slot(id).and_then(|p| p.parent)
        }

        pub fn children(&self, id: PositionId) -> &[PositionId] {
            self.slot(id).map(|p| p.children.as_slice()).unwrap_or(&[])
        }

        /// Depth of a position; 0 for the root.
        ///
        /// # Panics
        /// If `id` is not live, or a non-root position has lost its heading.
        pub fn level(&self, id: PositionId) -> u8 {
            let position = self.live(id);
            match (&position.node.heading, position.parent) {
                (Some(heading), _) => heading.level,
                (None, None) => 0,
                (None, Some(_)) => panic!("outline position {id} has a parent but no heading"),
            }
        }

        /// Places a heading node in document order and returns its position.
        ///
        /// The node goes under the last position in pre-order when that one is shallower,
        /// otherwise under the nearest ancestor of it whose level is below `level`.
        /// Skipped levels are allowed: a level-3 heading directly under a level-1 heading
        /// becomes its child.
        pub fn insert_heading(&mut self, level: u8, mut node: Node) -> Result<PositionId, TreeError> {
            if level < 1 {
                return Err(TreeError::InvalidLevel(level));
            }
            let heading = node.heading.as_mut().ok_or(TreeError::MissingHeading)?;
            heading.level = level;

            let last = self.last_leaf();
            let parent = if self.level(last) < level {
                last
            } else {
                self.walk_back_to_level(last, level - 1)
                    .ok_or(TreeError::UnknownInsert(level))?
            };
            let id = self.allocate(node);
            self.link(parent, id, None);
            debug!(position = %id, parent = %parent, level, "inserted heading");
            Ok(id)
        }

        fn last_leaf(&self) -> PositionId {
            let mut current = ROOT;
            while let Some(&last) = self.children(current).last() {
                current = last;
            }
            current
        }

        /// Nearest position, starting at `from` and walking up, whose level is at most
        /// `target`. `None` if the walk passes the root.
        pub fn walk_back_to_level(&self, from: PositionId, target: u8) -> Option<PositionId> {
            let mut current = Some(from).filter(|id| self.contains(*id));
            while let Some(id) = current {
                if self.level(id) <= target {
                    return Some(id);
                }
                current = self.parent(id);
            }
            None
        }

        /// Leaves of the subtree at `from`, left to right; `[from]` when it has no children.
        pub fn end_nodes(&self, from: PositionId) -> Vec<PositionId> {
            if !self.contains(from) {
                return vec![];
            }
            let leaves: Vec<_> = self
                .flatten(from)
                .into_iter()
                .filter(|id| self.children(*id).is_empty())
                .collect();
            leaves
        }

        /// `from` followed by all its descendants in pre-order.
        pub fn flatten(&self, from: PositionId) -> Vec<PositionId> {
            let mut out = Vec::new();
            if !self.contains(from) {
                return out;
            }
            let mut stack = vec![from];
            while let Some(id) = stack.pop() {
                out.push(id);
                stack.extend(self.children(id).iter().rev().copied());
            }
            out
        }

        /// Ancestors of `id`, nearest first, ending with the root.
        pub fn ancestors(&self, id: PositionId) -> Vec<PositionId> {
            let mut out = Vec::new();
            let mut current = self.parent(id);
            while let Some(p) = current {
                out.push(p);
                current = self.parent(p);
            }
            out
        }

        /// Heading nodes in document order, the root excluded.
        pub fn iter(&self) -> impl Iterator<Item = (PositionId, &Node)> + '_ {
            self.flatten(ROOT)
                .into_iter()
                .skip(1)
                .filter_map(move |id| self.node(id).map(|n| (id, n)))
        }

        /// Tags declared on ancestors of `id`, root first, without duplicates.
        ///
        /// With `include_all` every tag passes unless it is in `exclude`; otherwise only
        /// tags listed in `include` pass. Tags on `id` itself are not part of the result.
        pub fn inherit_tags<S: AsRef<str>>(
            &self,
            id: PositionId,
            include: &[S],
            exclude: &[S],
            include_all: bool,
        ) -> IndexSet<Tag> {
            let mut out = IndexSet::new();
            if include.is_empty() && !include_all {
                return out;
            }
            let listed = |list: &[S], tag: &Tag| list.iter().any(|s| s.as_ref() == tag.as_str());
            for ancestor in self.ancestors(id).into_iter().rev() {
                if self.level(ancestor) == 0 {
                    continue;
                }
                let Some(heading) = self.node(ancestor).and_then(|n| n.heading.as_ref()) else {
                    continue;
                };
                for tag in &heading.tags {
                    let admitted = if include_all {
                        !listed(exclude, tag)
                    } else {
                        listed(include, tag)
                    };
                    if admitted {
                        out.insert(tag.clone());
                    }
                }
            }
            out
        }

        /// Positions whose drawer has, for any wanted key, one of the wanted values.
        /// Pre-order; each position appears once.
        pub fn find_by_properties(&self, wanted: &IndexMap<String, Vec<String>>) -> Vec<PositionId> {
            self.flatten(ROOT)
                .into_iter()
                .filter(|id| {
                    self.node(*id).is_some_and(|node| {
                        node.properties
                            .props
                            .iter()
                            .any(|(k, v)| wanted.get(k).is_some_and(|values| values.contains(v)))
                    })
                })
                .collect()
        }

        /// Grafts `subtree` under `anchor` and returns the positions of the grafted nodes.
        ///
        /// The grafted headings and the anchor's former descendants are laid out again
        /// in that order, nesting by level. Anything deeper than the anchor stays below it;
        /// a heading at or above the anchor's level climbs to the ancestor that can hold it
        /// and is placed right after the branch the anchor lives in.
        ///
        /// Only the anchor's own descendants are re-parented. Its following siblings keep
        /// their parent, so splicing `X(1)` at `B` in `A(1) > [B(2), C(2)]` yields
        /// `A > [B, C]` then `X`.
        pub fn splice_subtree(
            &mut self,
            anchor: PositionId,
            subtree: OutlineTree,
        ) -> Result<Vec<PositionId>, TreeError> {
            if !self.contains(anchor) {
                return Err(TreeError::UnknownPosition(anchor));
            }
            let anchor_level = self.level(anchor);

            let spliced: Vec<PositionId> = subtree
                .into_nodes()
                .into_iter()
                .map(|node| self.allocate(node))
                .collect();
            let mut flat = spliced.clone();
            flat.extend(self.flatten(anchor).into_iter().skip(1));

            for id in &flat {
                let position = self.live_mut(*id);
                position.parent = None;
                position.children.clear();
            }
            self.live_mut(anchor).children.clear();

            let mut stack: Vec<PositionId> = Vec::new();
            let mut roots = Vec::new();
            for &id in &flat {
                let level = self.level(id);
                while stack.last().is_some_and(|top| self.level(*top) >= level) {
                    stack.pop();
                }
                match stack.last() {
                    Some(&parent) => self.link(parent, id, None),
                    None => roots.push(id),
                }
                stack.push(id);
            }

            let mut placed: HashMap<PositionId, PositionId> = HashMap::new();
            for root in roots {
                let level = self.level(root);
                if level > anchor_level {
                    self.link(anchor, root, None);
                    continue;
                }
                let parent = self
                    .walk_back_to_level(anchor, level - 1)
                    .ok_or(TreeError::UnknownInsert(level))?;
                let after = match placed.get(&parent) {
                    Some(&previous) => previous,
                    None => self.branch_toward(parent, anchor),
                };
                let index = self
                    .children(parent)
                    .iter()
                    .position(|c| *c == after)
                    .map(|i| i + 1);
                self.link(parent, root, index);
                placed.insert(parent, root);
            }
            debug!(anchor = %anchor, spliced = spliced.len(), "spliced subtree");
            Ok(spliced)
        }

        /// Removes the subtree at `id` and returns it as a tree of its own.
        pub fn detach_subtree(&mut self, id: PositionId) -> Result<OutlineTree, TreeError> {
            if id == ROOT {
                return Err(TreeError::DetachRoot);
            }
            if !self.contains(id) {
                return Err(TreeError::UnknownPosition(id));
            }
            if let Some(parent) = self.parent(id) {
                self.live_mut(parent).children.retain(|c| *c != id);
            }

            let mut detached = OutlineTree::new();
            let mut mapping: HashMap<PositionId, PositionId> = HashMap::new();
            for old in self.flatten(id) {
                let Some(position) = self.slots[old.0].take() else {
                    continue;
                };
                let parent = position
                    .parent
                    .and_then(|p| mapping.get(&p).copied())
                    .unwrap_or(ROOT);
                let new = detached.allocate(position.node);
                detached.link(parent, new, None);
                mapping.insert(old, new);
            }
            debug!(position = %id, nodes = mapping.len(), "detached subtree");
            Ok(detached)
        }

        /// Every parent strictly shallower than its children, links consistent both ways.
        pub fn is_well_formed(&self) -> bool {
            self.flatten(ROOT).into_iter().all(|id| {
                let level = self.level(id);
                self.children(id).iter().all(|child| {
                    self.parent(*child) == Some(id)
                        && self.node(*child).and_then(Node::level).is_some_and(|l| l > level)
                })
            })
        }

        /// Child of `ancestor` on the path down to `descendant`.
        fn branch_toward(&self, ancestor: PositionId, descendant: PositionId) -> PositionId {
            let mut current = descendant;
            while let Some(parent) = self.parent(current) {
                if parent == ancestor {
                    break;
                }
                current = parent;
            }
            current
        }

        fn allocate(&mut self, mut node: Node) -> PositionId {
            let id = PositionId(self.slots.len());
            node.position = Some(id);
            node.document = self.document;
            self.slots.push(Some(Position {
                node,
                parent: None,
                children: vec![],
            }));
            id
        }

        fn link(&mut self, parent: PositionId, child: PositionId, index: Option<usize>) {
            self.live_mut(child).parent = Some(parent);
            let children = &mut self.live_mut(parent).children;
            match index {
                Some(i) if i <= children.len() => children.insert(i, child),
                _ => children.push(child),
            }
        }

        /// Heading nodes in pre-order, moved out of the arena.
        fn into_nodes(mut self) -> Vec<Node> {
            let order = self.flatten(ROOT);
            order
                .into_iter()
                .skip(1)
                .filter_map(|id| self.slots[id.0].take().map(|p| p.node))
                .collect()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{Heading, Node};

        fn node(text: &str) -> Node {
            Node::new(Heading::new(0, text))
        }

        fn titles(tree: &OutlineTree, ids: &[PositionId]) -> Vec<String> {
            ids.iter()
                .map(|id| tree.node(*id).unwrap().title().to_string())
                .collect()
        }

        fn outline(levels: &[(u8, &str)]) -> (OutlineTree, Vec<PositionId>) {
            let mut tree = OutlineTree::new();
            let ids = levels
                .iter()
                .map(|(level, text)| tree.insert_heading(*level, node(text)).unwrap())
                .collect();
            (tree, ids)
        }

        #[test]
        fn insert_nests_by_level() {
            let (tree, ids) = outline(&[(1, "A"), (2, "B"), (2, "C"), (1, "D"), (3, "E")]);
            let root = tree.root();
            assert_eq!(titles(&tree, tree.children(root)), vec!["A", "D"]);
            assert_eq!(titles(&tree, tree.children(ids[0])), vec!["B", "C"]);
            // Level jump: E hangs directly off D.
            assert_eq!(tree.parent(ids[4]), Some(ids[3]));
            assert_eq!(tree.level(ids[4]), 3);
            assert!(tree.is_well_formed());
            assert_eq!(tree.len(), 5);
        }

        #[test]
        fn first_heading_may_start_deep() {
            let (tree, ids) = outline(&[(3, "deep"), (1, "top")]);
            assert_eq!(tree.parent(ids[0]), Some(tree.root()));
            assert_eq!(titles(&tree, tree.children(tree.root())), vec!["deep", "top"]);
        }

        #[test]
        fn insert_rejects_level_zero_and_headless_nodes() {
            let mut tree = OutlineTree::new();
            assert_eq!(tree.insert_heading(0, node("x")), Err(TreeError::InvalidLevel(0)));
            assert_eq!(
                tree.insert_heading(1, Node::default()),
                Err(TreeError::MissingHeading)
            );
            assert!(tree.is_empty());
        }

        #[test]
        fn inserted_node_knows_its_position() {
            let (tree, ids) = outline(&[(1, "A")]);
            assert_eq!(tree.node(ids[0]).unwrap().position(), Some(ids[0]));
        }

        #[test]
        fn walk_back_uses_at_most_semantics() {
            let (tree, ids) = outline(&[(1, "A"), (2, "B"), (3, "C")]);
            assert_eq!(tree.walk_back_to_level(ids[2], 1), Some(ids[0]));
            assert_eq!(tree.walk_back_to_level(ids[2], 3), Some(ids[2]));
            assert_eq!(tree.walk_back_to_level(ids[2], 0), Some(tree.root()));
        }

        #[test]
        fn end_nodes_lists_leaves_in_order() {
            let (tree, ids) = outline(&[(1, "A"), (2, "B"), (3, "C"), (2, "D"), (1, "E")]);
            assert_eq!(titles(&tree, &tree.end_nodes(tree.root())), vec!["C", "D", "E"]);
            assert_eq!(tree.end_nodes(ids[3]), vec![ids[3]]);
        }

        #[test]
        fn splice_child_level_graft_precedes_existing_children() {
            let (mut tree, ids) = outline(&[(1, "A"), (2, "B"), (2, "C")]);
            let (graft, _) = outline(&[(2, "X")]);
            let spliced = tree.splice_subtree(ids[0], graft).unwrap();
            assert_eq!(spliced.len(), 1);
            assert_eq!(titles(&tree, tree.children(ids[0])), vec!["X", "B", "C"]);
            assert!(tree.is_well_formed());
        }

        #[test]
        fn splice_sibling_level_heading_takes_anchor_children_only() {
            let (mut tree, ids) = outline(&[(1, "A"), (2, "B"), (3, "C"), (3, "D"), (2, "E")]);
            let (graft, _) = outline(&[(2, "X")]);
            tree.splice_subtree(ids[1], graft).unwrap();
            // X sits after B under A and takes over B's former children.
            assert_eq!(titles(&tree, tree.children(ids[0])), vec!["B", "X", "E"]);
            let x = tree.children(ids[0])[1];
            assert_eq!(titles(&tree, tree.children(x)), vec!["C", "D"]);
            assert!(tree.children(ids[1]).is_empty());
            assert!(tree.is_well_formed());
        }

        #[test]
        fn splice_top_level_heading_leaves_anchor_siblings_in_place() {
            let (mut tree, ids) = outline(&[(1, "A"), (2, "B"), (2, "C")]);
            let (graft, _) = outline(&[(1, "X")]);
            tree.splice_subtree(ids[1], graft).unwrap();
            assert_eq!(titles(&tree, tree.children(tree.root())), vec!["A", "X"]);
            assert_eq!(titles(&tree, tree.children(ids[0])), vec!["B", "C"]);
            assert!(tree.is_well_formed());
        }

        #[test]
        fn splice_deeper_subtree_nests_under_anchor() {
            let (mut tree, ids) = outline(&[(1, "A"), (2, "B")]);
            let (graft, _) = outline(&[(2, "X"), (3, "Y")]);
            let spliced = tree.splice_subtree(ids[0], graft).unwrap();
            assert_eq!(titles(&tree, &spliced), vec!["X", "Y"]);
            assert_eq!(titles(&tree, tree.children(ids[0])), vec!["X", "B"]);
            assert_eq!(tree.parent(spliced[1]), Some(spliced[0]));
            assert_eq!(tree.node(spliced[1]).unwrap().position(), Some(spliced[1]));
        }

        #[test]
        fn splice_into_unknown_position_fails() {
            let (mut tree, _) = outline(&[(1, "A")]);
            let bogus = PositionId(42);
            assert_eq!(
                tree.splice_subtree(bogus, OutlineTree::new()),
                Err(TreeError::UnknownPosition(bogus))
            );
        }

        #[test]
        fn inherit_tags_accumulates_from_ancestors_only() {
            let mut tree = OutlineTree::new();
            let a = tree
                .insert_heading(1, Node::new(Heading::new(1, "A").with_tags(["t1"])))
                .unwrap();
            let b = tree
                .insert_heading(2, Node::new(Heading::new(2, "B").with_tags(["t2"])))
                .unwrap();
            let c = tree
                .insert_heading(3, Node::new(Heading::new(3, "C").with_tags(["t1", "t3"])))
                .unwrap();
            let none: [&str; 0] = [];

            let tags = tree.inherit_tags(b, &none, &none, true);
            assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec![Tag::from("t1")]);

            let tags = tree.inherit_tags(c, &none, &none, true);
            assert_eq!(
                tags.into_iter().collect::<Vec<_>>(),
                vec![Tag::from("t1"), Tag::from("t2")]
            );

            assert!(tree.inherit_tags(a, &none, &none, true).is_empty());
            assert!(tree.inherit_tags(c, &none, &none, false).is_empty());
            let only = tree.inherit_tags(c, &["t2"], &[], false);
            assert_eq!(only.into_iter().collect::<Vec<_>>(), vec![Tag::from("t2")]);
            let skip = tree.inherit_tags(c, &[], &["t1"], true);
            assert_eq!(skip.into_iter().collect::<Vec<_>>(), vec![Tag::from("t2")]);
        }

        #[test]
        fn find_by_properties_matches_any_wanted_pair_once() {
            let mut tree = OutlineTree::new();
            let a = tree
                .insert_heading(
                    1,
                    node("A").with_property("Owner", "ann").with_property("Team", "core"),
                )
                .unwrap();
            tree.insert_heading(2, node("B").with_property("Owner", "bob"))
                .unwrap();
            let c = tree
                .insert_heading(1, node("C").with_property("Team", "core"))
                .unwrap();

            let mut wanted = IndexMap::new();
            wanted.insert("Owner".to_string(), vec!["ann".to_string()]);
            wanted.insert("Team".to_string(), vec!["core".to_string()]);
            assert_eq!(tree.find_by_properties(&wanted), vec![a, c]);
        }

        #[test]
        fn detach_returns_rerooted_subtree() {
            let (mut tree, ids) = outline(&[(1, "A"), (2, "B"), (3, "C"), (1, "D")]);
            let detached = tree.detach_subtree(ids[1]).unwrap();
            assert_eq!(tree.len(), 2);
            assert!(!tree.contains(ids[2]));
            assert_eq!(titles(&tree, tree.children(tree.root())), vec!["A", "D"]);

            let top = detached.children(detached.root());
            assert_eq!(titles(&detached, top), vec!["B"]);
            assert_eq!(titles(&detached, detached.children(top[0])), vec!["C"]);
            assert_eq!(tree.detach_subtree(tree.root()), Err(TreeError::DetachRoot));
        }

        #[test]
        #[should_panic(expected = "has a parent but no heading")]
        fn headless_non_root_position_is_a_programming_error() {
            let (mut tree, ids) = outline(&[(1, "A")]);
            tree.node_mut(ids[0]).unwrap().heading = None;
            tree.level(ids[0]);
        }
    }
}

pub mod document {
    //! A document: buffer settings plus one outline tree.

    use crate::core::{DocumentId, Heading, Node, Property, PropertyError, Tag};
    use crate::settings::{BufferSettings, ConfigError};
    use crate::tree::{OutlineTree, PositionId, TreeError};
    use indexmap::{IndexMap, IndexSet};
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Document {
        pub id: DocumentId,
        pub settings: BufferSettings,
        tree: OutlineTree,
    }

    impl Default for Document {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Document {
        pub fn new() -> Self {
            Self::with_settings(BufferSettings::default())
        }

        pub fn with_settings(settings: BufferSettings) -> Self {
            let id = DocumentId::new();
            Self {
                id,
                settings,
                tree: OutlineTree::for_document(id),
            }
        }

        pub fn tree(&self) -> &OutlineTree {
            &self.tree
        }

        pub fn tree_mut(&mut self) -> &mut OutlineTree {
            &mut self.tree
        }

        pub fn root(&self) -> PositionId {
            self.tree.root()
        }

        pub fn node(&self, id: PositionId) -> Option<&Node> {
            self.tree.node(id)
        }

        pub fn node_mut(&mut self, id: PositionId) -> Option<&mut Node> {
            self.tree.node_mut(id)
        }

        pub fn headings(&self) -> impl Iterator<Item = (PositionId, &Node)> + '_ {
            self.tree.iter()
        }

        pub fn add_heading(&mut self, level: u8, text: impl Into<String>) -> Result<PositionId, TreeError> {
            self.append_node(Node::new(Heading::new(level, text)))
        }

        /// Appends a node at the level its heading declares.
        pub fn append_node(&mut self, node: Node) -> Result<PositionId, TreeError> {
            let level = node.level().ok_or(TreeError::MissingHeading)?;
            self.tree.insert_heading(level, node)
        }

        pub fn splice(&mut self, anchor: PositionId, subtree: OutlineTree) -> Result<Vec<PositionId>, TreeError> {
            self.tree.splice_subtree(anchor, subtree)
        }

        pub fn detach(&mut self, id: PositionId) -> Result<OutlineTree, TreeError> {
            self.tree.detach_subtree(id)
        }

        pub fn find_by_properties(&self, wanted: &IndexMap<String, Vec<String>>) -> Vec<PositionId> {
            self.tree.find_by_properties(wanted)
        }

        /// Tags `id` inherits: file tags first, then ancestor tags, filtered by the
        /// buffer's inheritance policy.
        pub fn inherited_tags(&self, id: PositionId) -> IndexSet<Tag> {
            let policy = &self.settings.tag_inheritance;
            let mut tags: IndexSet<Tag> = self
                .settings
                .file_tags
                .iter()
                .filter(|t| policy.admits(t))
                .cloned()
                .collect();
            tags.extend(
                self.tree
                    .inherit_tags(id, policy.include.as_slice(), policy.exclude.as_slice(), policy.inherit_all),
            );
            tags
        }

        /// Inherited tags followed by the node's own.
        pub fn all_tags(&self, id: PositionId) -> IndexSet<Tag> {
            let mut tags = self.inherited_tags(id);
            if let Some(heading) = self.node(id).and_then(|n| n.heading.as_ref()) {
                tags.extend(heading.tags.iter().cloned());
            }
            tags
        }

        /// Closest `<key>_ALL` restriction: the node, its ancestors, then `#+PROPERTY:`.
        pub fn property_restriction(&self, id: PositionId, key: &str) -> Option<Property> {
            std::iter::once(id)
                .chain(self.tree.ancestors(id))
                .find_map(|p| self.node(p).and_then(|n| n.properties.restriction_for(key)))
                .or_else(|| self.settings.properties.restriction_for(key))
        }

        /// Value of `key` at `id`, falling back to ancestors and buffer properties when the
        /// inheritance policy allows it.
        pub fn property(&self, id: PositionId, key: &str) -> Option<Property> {
            if let Some(own) = self.node(id).and_then(|n| n.properties.get(key)) {
                return Some(own);
            }
            if !self.settings.property_inheritance.inherits(key) {
                return None;
            }
            self.tree
                .ancestors(id)
                .into_iter()
                .find_map(|p| self.node(p).and_then(|n| n.properties.get(key)))
                .or_else(|| self.settings.properties.get(key))
        }

        pub fn validate_property(&self, id: PositionId, property: &Property) -> Result<(), PropertyError> {
            match self.property_restriction(id, &property.key) {
                Some(restriction) => restriction.validate(property),
                None => Ok(()),
            }
        }

        /// Every property value that violates a restriction in scope.
        pub fn validate_properties(&self) -> Vec<(PositionId, PropertyError)> {
            let mut failures = Vec::new();
            for (id, node) in self.headings() {
                for property in node.properties.iter().filter(|p| !p.is_value_restriction()) {
                    if let Err(e) = self.validate_property(id, &property) {
                        failures.push((id, e));
                    }
                }
            }
            failures
        }

        /// Headings whose priority cookie lies outside the buffer's range.
        pub fn validate_priorities(&self) -> Vec<(PositionId, ConfigError)> {
            self.headings()
                .filter_map(|(id, node)| {
                    let heading = node.heading.as_ref()?;
                    self.settings.priorities.check(&heading.priority).err().map(|e| (id, e))
                })
                .collect()
        }
    }

}

pub mod agenda {
    //! Agenda projection: planning timestamps expanded into dated occurrences.

    use crate::core::{HeadingPriority, Tag};
    use crate::document::Document;
    use crate::repeat::{RepeatConfig, RepeatError, RepeatStamp, Repeater};
    use crate::temporal::{PlanningKind, Timestamp, Timing};
    use crate::tree::PositionId;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Serialize};

    /// Inclusive day range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AgendaRange {
        pub from: NaiveDate,
        pub to: NaiveDate,
    }

    impl AgendaRange {
        pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
            Self { from, to }
        }

        pub fn day(date: NaiveDate) -> Self {
            Self::new(date, date)
        }

        /// Half-open instant bounds covering every day of the range.
        pub fn bounds(&self) -> (NaiveDateTime, NaiveDateTime) {
            let start = self.from.and_time(NaiveTime::MIN);
            let end = self
                .to
                .succ_opt()
                .map(|d| d.and_time(NaiveTime::MIN))
                .unwrap_or(NaiveDateTime::MAX);
            (start, end)
        }

        pub fn contains(&self, t: NaiveDateTime) -> bool {
            let (start, end) = self.bounds();
            t >= start && t < end
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct AgendaItem {
        pub position: PositionId,
        pub kind: PlanningKind,
        pub occurrence: Timestamp,
        pub title: String,
        pub keyword: Option<String>,
        pub priority: HeadingPriority,
        pub tags: Vec<Tag>,
        /// Ancestor titles, outermost first.
        pub context_path: Vec<String>,
    }

    /// Occurrences of `stamp` touching `[from, to)`. Non-repeating stamps yield at most
    /// themselves.
    pub fn occurrences(
        stamp: &Timestamp,
        config: &RepeatConfig,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<Timestamp>, RepeatError> {
        if !stamp.is_repeating() {
            return Ok(if stamp.in_window(from, to) {
                vec![stamp.clone()]
            } else {
                vec![]
            });
        }
        let origin = RepeatStamp::new(stamp.clone(), *config);
        let (mut k, mut current) = origin.locate(from)?;
        let mut out = Vec::new();
        while current.start() < to {
            if current.stamp.in_window(from, to) {
                out.push(current.stamp.clone());
            }
            k = k.checked_add(1).ok_or(RepeatError::OutOfRange)?;
            let next = origin.shift_n(k)?;
            if next.start() <= current.start() {
                return Err(RepeatError::NonAdvancing(stamp.cookie().unwrap_or_default()));
            }
            current = next;
        }
        Ok(out)
    }

    /// Agenda items of `document` within `range`, sorted by occurrence start.
    ///
    /// Inactive timestamps, diary sexps and headings under a `COMMENT` heading are skipped.
    pub fn project(document: &Document, range: &AgendaRange) -> Result<Vec<AgendaItem>, RepeatError> {
        let (from, to) = range.bounds();
        let config = document.settings.repeat;
        let tree = document.tree();
        let mut items = Vec::new();

        for (id, node) in tree.iter() {
            let Some(heading) = node.heading.as_ref() else {
                continue;
            };
            let ancestors: Vec<_> = tree
                .ancestors(id)
                .into_iter()
                .rev()
                .filter_map(|p| tree.node(p))
                .filter(|n| n.heading.is_some())
                .collect();
            if heading.commented || ancestors.iter().any(|n| n.is_commented()) {
                continue;
            }

            for planning in node.planning.iter().filter(|p| p.timing.is_active()) {
                let hits = match &planning.timing {
                    Timing::Timestamp(ts) => occurrences(ts, &config, from, to)?,
                    Timing::Range(r) if r.in_window(from, to) => vec![r.as_span()],
                    Timing::Range(_) | Timing::Sexp(_) => vec![],
                };
                for occurrence in hits {
                    items.push(AgendaItem {
                        position: id,
                        kind: planning.kind,
                        occurrence,
                        title: heading.text.clone(),
                        keyword: heading.keyword.clone(),
                        priority: heading.priority,
                        tags: document.all_tags(id).into_iter().collect(),
                        context_path: ancestors.iter().map(|n| n.title().to_string()).collect(),
                    });
                }
            }
        }
        items.sort_by_key(|item| item.occurrence.start);
        Ok(items)
    }

}

pub mod parser {
    //! Org reader built on `nom`.
    //!
    //! Parsing strategy:
    //! - The scan is line-oriented. `#+KEY:` lines before the first heading fill the buffer
    //!   settings; anything else there becomes the root node's section.
    //! - Each *headline* is parsed with `nom` combinators (keyword, priority, COMMENT, title,
    //!   tags) and handed to `Document::append_node`, which nests it by level.
    //! - Under a headline we take planning lines, the property drawer, then drawers, keyword
    //!   lines, comments and paragraph runs until the next headline. Lines we do not model
    //!   are kept verbatim.

    use crate::core::{ClockEntry, Drawer, Element, Heading, HeadingPriority, Node, Property, Tag};
    use crate::document::Document;
    use crate::settings::{BufferSettings, HeadingPrioritySetting, TodoSequence, TodoSequenceKind};
    use crate::temporal::{
        IntervalUnit, Planning, PlanningKind, Repeat, RepeatKind, Timestamp, TimestampRange, Timing,
        WarningPeriod,
    };
    use anyhow::{Context, Result, anyhow, bail};
    use chrono::{NaiveDate, NaiveTime};
    use indexmap::IndexSet;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_till1, take_until, take_while_m_n, take_while1},
        character::complete::{anychar, char, digit1, not_line_ending, space0, space1},
        combinator::{map, map_opt, map_res, opt, value},
        error::{VerboseError, VerboseErrorKind},
        multi::separated_list1,
        sequence::{delimited, pair, preceded, terminated, tuple},
    };
    use std::{fs, path::Path};
    use tracing::{debug, warn};

    /// Source of parsed documents.
    pub trait DocumentParser {
        fn parse_file(&self, path: &Path) -> Result<Document>;
    }

    pub struct NomParser;

    impl DocumentParser for NomParser {
        fn parse_file(&self, path: &Path) -> Result<Document> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            parse_document(&text).with_context(|| format!("parsing {:?}", path))
        }
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn to_anyhow(label: &'static str) -> impl Fn(nom::Err<VerboseError<&str>>) -> anyhow::Error {
        move |e| match e {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => anyhow!(pretty_verbose_error(label, ve)),
            nom::Err::Incomplete(_) => anyhow!("incomplete input while parsing {}", label),
        }
    }

    fn pretty_verbose_error(label: &str, ve: VerboseError<&str>) -> String {
        use std::fmt::Write;
        let mut s = String::new();
        let _ = writeln!(s, "parse error in {}:", label);
        for (frag, kind) in ve.errors {
            let _ = writeln!(s, "  at: {:?}  {:?}", frag, kind);
        }
        s
    }

    /* ------------------------ Public entry points ------------------------ */

    /// Parses a whole buffer. Fails on malformed headlines and on invalid buffer settings
    /// (colliding todo keywords, a mixed priority range).
    pub fn parse_document(input: &str) -> Result<Document> {
        let lines: Vec<&str> = input.lines().collect();
        let first_heading = lines
            .iter()
            .position(|l| is_heading_line(l))
            .unwrap_or(lines.len());

        // 1) Buffer settings & preamble.
        let mut settings = BufferSettings::default();
        let mut todo_declared = false;
        let mut preamble = Vec::new();
        for line in &lines[..first_heading] {
            let known = match keyword_line(line) {
                Ok((_, (key, value))) => apply_setting(&mut settings, &mut todo_declared, key, value)
                    .with_context(|| format!("#+{key}: {value}"))?,
                Err(_) => false,
            };
            if !known {
                preamble.push(*line);
            }
        }
        settings.validate().context("buffer settings")?;

        let mut document = Document::with_settings(settings);
        let root = document.root();
        if let Some(node) = document.node_mut(root) {
            for element in parse_elements(&preamble) {
                node.push_element(element);
            }
        }

        // 2) Headings, in source order.
        let mut idx = first_heading;
        while idx < lines.len() {
            let line_no = idx + 1;
            let (_, heading) = headline(lines[idx], &document.settings)
                .map_err(to_anyhow("headline"))
                .with_context(|| format!("line {line_no}"))?;
            let end = lines[idx + 1..]
                .iter()
                .position(|l| is_heading_line(l))
                .map_or(lines.len(), |p| idx + 1 + p);

            let mut node = Node::new(heading);
            fill_node(&mut node, &lines[idx + 1..end]);
            document
                .append_node(node)
                .with_context(|| format!("placing heading on line {line_no}"))?;
            idx = end;
        }

        debug!(headings = document.tree().len(), "parsed document");
        Ok(document)
    }

    /// Parses one timing expression: a timestamp, a `--` range or a `<%%(...)>` sexp.
    pub fn parse_timing(input: &str) -> Result<Timing> {
        match timing(input.trim()) {
            Ok(("", t)) => Ok(t),
            Ok((rest, _)) => bail!("unexpected trailing input {rest:?}"),
            Err(e) => Err(to_anyhow("timestamp")(e)),
        }
    }

    pub(crate) fn parse_repeat(s: &str) -> Option<Repeat> {
        match cookie(s) {
            Ok(("", (repeat, _))) => repeat,
            _ => None,
        }
    }

    /* ------------------------------ Settings ------------------------------ */

    /// Returns false for keywords that are not buffer settings.
    fn apply_setting(
        settings: &mut BufferSettings,
        todo_declared: &mut bool,
        key: &str,
        value: &str,
    ) -> Result<bool> {
        match key.to_ascii_uppercase().as_str() {
            "TITLE" => settings.title = Some(value.to_string()),
            "FILETAGS" => settings.file_tags.extend(
                value
                    .split(|c: char| c == ':' || c.is_whitespace())
                    .filter(|t| !t.is_empty())
                    .map(Tag::from),
            ),
            "TODO" | "SEQ_TODO" | "TYP_TODO" => {
                // A buffer that declares its own vocabulary drops the stock TODO/DONE.
                if !*todo_declared {
                    settings.todo.clear();
                    *todo_declared = true;
                }
                let kind: TodoSequenceKind = key.parse()?;
                let items: Vec<&str> = value.split_whitespace().collect();
                settings.todo.add(TodoSequence::from_items(kind, &items)?)?;
            }
            "PRIORITIES" => settings.priorities = priorities(value)?,
            "PROPERTY" => {
                let (k, v) = value.split_once(char::is_whitespace).unwrap_or((value, ""));
                settings.properties.set(Property::new(k, v.trim()));
            }
            "CATEGORY" => settings.category = Some(value.to_string()),
            "ARCHIVE" => settings.archive = Some(value.to_string()),
            "COLUMNS" => settings.columns = Some(value.to_string()),
            "CONSTANTS" => {
                for pair in value.split_whitespace() {
                    let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                    settings.constants.insert(k.to_string(), v.to_string());
                }
            }
            "LINK" => {
                let (k, v) = value.split_once(char::is_whitespace).unwrap_or((value, ""));
                settings.links.insert(k.to_string(), v.trim().to_string());
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn priorities(value: &str) -> Result<HeadingPrioritySetting> {
        let parts = value
            .split_whitespace()
            .map(|p| p.parse::<HeadingPriority>().map_err(|e| anyhow!(e)))
            .collect::<Result<Vec<_>>>()?;
        let setting = match parts.as_slice() {
            [highest, lowest, default] => HeadingPrioritySetting {
                highest: *highest,
                lowest: *lowest,
                default: *default,
            },
            _ => bail!("expected highest, lowest and default priority, got {value:?}"),
        };
        setting.validate()?;
        Ok(setting)
    }

    /* ------------------------------ Headlines ------------------------------ */

    fn is_heading_line(line: &str) -> bool {
        let stars = line.chars().take_while(|c| *c == '*').count();
        stars > 0 && line[stars..].starts_with(' ')
    }

    fn headline<'a>(i: &'a str, settings: &BufferSettings) -> PResult<'a, Heading> {
        let (i, stars) = terminated(take_while1(|c: char| c == '*'), space1)(i)?;
        let level = u8::try_from(stars.len()).map_err(|_| {
            nom::Err::Failure(VerboseError {
                errors: vec![(stars, VerboseErrorKind::Context("heading level"))],
            })
        })?;

        let mut heading = Heading::new(level, "");
        let mut rest = i.trim_end();
        if let Some((word, after)) = split_word(rest) {
            if settings.todo.is_keyword(word) {
                heading.keyword = Some(word.to_string());
                rest = after;
            }
        }
        if let Ok((after, priority)) = priority_cookie(rest) {
            heading.priority = priority;
            rest = after.trim_start();
        }
        if let Some((word, after)) = split_word(rest) {
            if word == "COMMENT" {
                heading.commented = true;
                rest = after;
            }
        }
        let (text, tags) = split_tags(rest);
        heading.text = text.to_string();
        heading.tags = tags;
        Ok(("", heading))
    }

    fn priority_cookie(i: &str) -> PResult<'_, HeadingPriority> {
        map_res(
            delimited(
                tag("[#"),
                take_while1(|c: char| c.is_ascii_alphanumeric()),
                char(']'),
            ),
            |p: &str| p.parse::<HeadingPriority>(),
        )(i)
    }

    fn split_word(s: &str) -> Option<(&str, &str)> {
        let s = s.trim_start();
        if s.is_empty() {
            return None;
        }
        let end = s.find(char::is_whitespace).unwrap_or(s.len());
        Some((&s[..end], s[end..].trim_start()))
    }

    fn split_tags(title: &str) -> (&str, IndexSet<Tag>) {
        let title = title.trim_end();
        let (text, candidate) = match title.rsplit_once(char::is_whitespace) {
            Some((text, candidate)) => (text.trim_end(), candidate),
            None => ("", title),
        };
        match colon_tags(candidate) {
            Some(tags) => (text, tags),
            None => (title, IndexSet::new()),
        }
    }

    fn colon_tags(s: &str) -> Option<IndexSet<Tag>> {
        let inner = s.strip_prefix(':')?.strip_suffix(':')?;
        if inner.is_empty() {
            return None;
        }
        let mut tags = IndexSet::new();
        for t in inner.split(':') {
            if t.is_empty() || !t.chars().all(is_tag_char) {
                return None;
            }
            tags.insert(Tag::from(t));
        }
        Some(tags)
    }

    fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '_' | '@' | '#' | '%')
    }

    /* --------------------------- Section content --------------------------- */

    fn fill_node(node: &mut Node, body: &[&str]) {
        let mut idx = 0;
        while let Some(line) = body.get(idx) {
            let line = line.trim();
            if let Ok(("", planning)) = planning_line(line) {
                node.planning.extend(planning);
            } else if let Ok(("", events)) = event_line(line) {
                node.planning.extend(events);
            } else {
                break;
            }
            idx += 1;
        }

        if body.get(idx).is_some_and(|l| l.trim() == ":PROPERTIES:") {
            match body[idx + 1..].iter().position(|l| l.trim() == ":END:") {
                Some(len) => {
                    for line in &body[idx + 1..idx + 1 + len] {
                        match property_line(line.trim()) {
                            Ok((_, property)) => {
                                node.properties.set(property);
                            }
                            Err(_) => warn!(line = %line, "skipping malformed property line"),
                        }
                    }
                    idx += len + 2;
                }
                None => warn!(heading = node.title(), "unterminated property drawer kept as text"),
            }
        }

        for element in parse_elements(&body[idx..]) {
            node.push_element(element);
        }
    }

    fn parse_elements(lines: &[&str]) -> Vec<Element> {
        let mut elements = Vec::new();
        let mut paragraph: Vec<String> = Vec::new();
        let mut idx = 0;
        while idx < lines.len() {
            let line = lines[idx];
            let trimmed = line.trim();

            if let Some(name) = drawer_name(trimmed) {
                let close = lines[idx + 1..]
                    .iter()
                    .position(|l| l.trim().eq_ignore_ascii_case(":END:"));
                if let Some(len) = close {
                    flush(&mut paragraph, &mut elements);
                    elements.push(Element::Drawer(drawer(name, &lines[idx + 1..idx + 1 + len])));
                    idx += len + 2;
                    continue;
                }
            }

            if let Ok(("", (key, value))) = keyword_line(trimmed) {
                flush(&mut paragraph, &mut elements);
                elements.push(Element::Keyword {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            } else if trimmed == "#" || trimmed.starts_with("# ") {
                flush(&mut paragraph, &mut elements);
                elements.push(Element::Comment(line.to_string()));
            } else {
                paragraph.push(line.to_string());
            }
            idx += 1;
        }
        flush(&mut paragraph, &mut elements);
        elements
    }

    fn flush(paragraph: &mut Vec<String>, elements: &mut Vec<Element>) {
        if !paragraph.is_empty() {
            elements.push(Element::Paragraph(std::mem::take(paragraph)));
        }
    }

    fn drawer_name(line: &str) -> Option<&str> {
        let name = line.strip_prefix(':')?.strip_suffix(':')?;
        let valid = !name.is_empty()
            && !name.eq_ignore_ascii_case("END")
            && name
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
        valid.then_some(name)
    }

    fn drawer(name: &str, lines: &[&str]) -> Drawer {
        let mut drawer = Drawer::new(name);
        drawer.elements = lines
            .iter()
            .map(|line| match clock_line(line.trim()) {
                Ok(("", clock)) => Element::Clock(clock),
                _ => Element::Raw(line.to_string()),
            })
            .collect();
        drawer
    }

    fn keyword_line(i: &str) -> PResult<'_, (&str, &str)> {
        let (i, key) = preceded(
            tag("#+"),
            take_till1(|c: char| c == ':' || c.is_whitespace()),
        )(i)?;
        let (i, _) = char(':')(i)?;
        let (i, value) = not_line_ending(i)?;
        Ok((i, (key, value.trim())))
    }

    fn property_line(i: &str) -> PResult<'_, Property> {
        let (i, key) = delimited(
            char(':'),
            take_till1(|c: char| c == ':' || c.is_whitespace()),
            char(':'),
        )(i)?;
        let (i, value) = not_line_ending(i)?;
        Ok((i, Property::new(key, value.trim())))
    }

    fn clock_line(i: &str) -> PResult<'_, ClockEntry> {
        // CLOCK: [2024-01-02 Tue 09:00]--[2024-01-02 Tue 10:30] =>  1:30
        let (i, _) = terminated(tag("CLOCK:"), space0)(i)?;
        let (i, start) = timestamp(i)?;
        let (i, end) = opt(preceded(tag("--"), timestamp))(i)?;
        let (i, _) = opt(tuple((space0, tag("=>"), not_line_ending)))(i)?;
        let mut range = start;
        range.end = end.map(|e| e.start);
        Ok((i, ClockEntry { range }))
    }

    /* ------------------------------ Planning ------------------------------ */

    fn planning_line(i: &str) -> PResult<'_, Vec<Planning>> {
        // SCHEDULED: <2024-01-15 Mon 10:00> DEADLINE: <...>  CLOSED: [...]
        separated_list1(space1, planning_item)(i)
    }

    fn planning_item(i: &str) -> PResult<'_, Planning> {
        let (i, kind) = alt((
            value(PlanningKind::Scheduled, tag("SCHEDULED:")),
            value(PlanningKind::Deadline, tag("DEADLINE:")),
            value(PlanningKind::Closed, tag("CLOSED:")),
        ))(i)?;
        let (i, when) = preceded(space0, timing)(i)?;
        Ok((i, Planning::new(kind, when)))
    }

    fn event_line(i: &str) -> PResult<'_, Vec<Planning>> {
        separated_list1(space1, map(timing, |t: Timing| Planning::event(t)))(i)
    }

    /* ------------------------------ Timestamps ------------------------------ */

    fn timing(i: &str) -> PResult<'_, Timing> {
        alt((
            map(delimited(tag("<%%"), take_until(">"), char('>')), |s: &str| {
                Timing::Sexp(s.to_string())
            }),
            range_or_stamp,
        ))(i)
    }

    fn range_or_stamp(i: &str) -> PResult<'_, Timing> {
        let (i, start) = timestamp(i)?;
        let (i, end) = opt(preceded(tag("--"), timestamp))(i)?;
        let when = match end {
            Some(end) => Timing::Range(TimestampRange::new(start, end)),
            None => Timing::Timestamp(start),
        };
        Ok((i, when))
    }

    fn timestamp(i: &str) -> PResult<'_, Timestamp> {
        // <2024-01-31 Wed 10:00-11:00 ++1m -3d>  or  [2024-01-31 Wed]
        let (i, open) = alt((char('<'), char('[')))(i)?;
        let close = if open == '<' { '>' } else { ']' };
        let (i, date) = date(i)?;
        let (i, _day) = opt(preceded(space1, take_while1(|c: char| c.is_alphabetic())))(i)?;
        let (i, times) = opt(preceded(space1, pair(time, opt(preceded(char('-'), time)))))(i)?;
        let (i, cookie_part) = opt(preceded(space1, cookie))(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = char(close)(i)?;

        let (start_time, end_time) = match times {
            Some((start, end)) => (Some(start), end),
            None => (None, None),
        };
        let (repeat, raw_cookie) = match cookie_part {
            Some((repeat, raw)) => (repeat, Some(raw.to_string())),
            None => (None, None),
        };
        Ok((
            i,
            Timestamp {
                start: date.and_time(start_time.unwrap_or(NaiveTime::MIN)),
                end: end_time.map(|t| date.and_time(t)),
                date_only: start_time.is_none(),
                active: open == '<',
                repeat,
                raw_cookie,
            },
        ))
    }

    fn date(i: &str) -> PResult<'_, NaiveDate> {
        map_opt(
            tuple((digits(4, 4), char('-'), digits(2, 2), char('-'), digits(2, 2))),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(i32::try_from(y).ok()?, m, d),
        )(i)
    }

    fn time(i: &str) -> PResult<'_, NaiveTime> {
        map_opt(
            tuple((digits(1, 2), char(':'), digits(2, 2))),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0),
        )(i)
    }

    fn digits(m: usize, n: usize) -> impl Fn(&str) -> PResult<'_, u32> {
        move |i: &str| {
            map_res(take_while_m_n(m, n, |c: char| c.is_ascii_digit()), |s: &str| {
                s.parse::<u32>()
            })(i)
        }
    }

    /// Repeater and/or warning period; also returns the exact text consumed.
    fn cookie(i: &str) -> PResult<'_, (Option<Repeat>, &str)> {
        let (rest, (repeater, warning)) = alt((
            map(
                pair(repeater, opt(preceded(space1, warning))),
                |(r, w)| (Some(r), w),
            ),
            map(warning, |w| (None, Some(w))),
        ))(i)?;
        let raw = &i[..i.len() - rest.len()];
        let repeat = repeater.map(|(kind, amount, unit)| Repeat {
            kind,
            unit,
            amount,
            agenda_window: warning,
        });
        Ok((rest, (repeat, raw)))
    }

    fn repeater(i: &str) -> PResult<'_, (RepeatKind, u32, IntervalUnit)> {
        tuple((
            alt((
                value(RepeatKind::ShiftFutureFixed, tag("++")),
                value(RepeatKind::ShiftFutureRelative, tag(".+")),
                value(RepeatKind::Shift, tag("+")),
            )),
            amount,
            unit,
        ))(i)
    }

    fn warning(i: &str) -> PResult<'_, WarningPeriod> {
        map(
            preceded(alt((tag("--"), tag("-"))), pair(amount, unit)),
            |(amount, unit)| WarningPeriod { amount, unit },
        )(i)
    }

    fn amount(i: &str) -> PResult<'_, u32> {
        map_res(digit1, |s: &str| s.parse::<u32>())(i)
    }

    fn unit(i: &str) -> PResult<'_, IntervalUnit> {
        map_opt(anychar, IntervalUnit::from_marker)(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::settings::ConfigError;
        use chrono::NaiveDateTime;
        use std::io::Write;

        fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, min, 0)
                .unwrap()
        }

        #[test]
        fn headline_with_keyword_priority_comment_and_tags() {
            let settings = BufferSettings::default();
            let (_, h) = headline("** TODO [#A] COMMENT Pay rent   :money:home:", &settings).unwrap();
            assert_eq!(h.level, 2);
            assert_eq!(h.keyword.as_deref(), Some("TODO"));
            assert_eq!(h.priority, HeadingPriority::Alpha('A'));
            assert!(h.commented);
            assert_eq!(h.text, "Pay rent");
            assert!(h.has_tag("money") && h.has_tag("home"));
        }

        #[test]
        fn unknown_keyword_stays_in_title() {
            let settings = BufferSettings::default();
            let (_, h) = headline("* WAITING for reply", &settings).unwrap();
            assert_eq!(h.keyword, None);
            assert_eq!(h.text, "WAITING for reply");
            let (_, h) = headline("* Ratio 1:2:3", &settings).unwrap();
            assert!(h.tags.is_empty());
        }

        #[test]
        fn timestamp_with_time_range_and_cookie() {
            let (rest, ts) = timestamp("<2024-01-15 Mon 10:00-10:30 ++1w -2d>").unwrap();
            assert_eq!(rest, "");
            assert_eq!(ts.start, at(2024, 1, 15, 10, 0));
            assert_eq!(ts.end, Some(at(2024, 1, 15, 10, 30)));
            assert!(ts.active && !ts.date_only);
            let repeat = ts.repeat.unwrap();
            assert_eq!(repeat.kind, RepeatKind::ShiftFutureFixed);
            assert_eq!(repeat.agenda_window.map(|w| w.amount), Some(2));
            assert_eq!(ts.raw_cookie.as_deref(), Some("++1w -2d"));
        }

        #[test]
        fn inactive_date_only_and_warning_without_repeater() {
            let (_, ts) = timestamp("[2024-02-29 Thu -3d]").unwrap();
            assert!(!ts.active);
            assert!(ts.date_only);
            assert_eq!(ts.repeat, None);
            assert_eq!(ts.raw_cookie.as_deref(), Some("-3d"));
        }

        #[test]
        fn timing_variants() {
            assert!(matches!(
                parse_timing("<2024-07-01 Mon>--<2024-07-10 Wed>").unwrap(),
                Timing::Range(_)
            ));
            assert_eq!(
                parse_timing("<%%(diary-float t 4 2)>").unwrap(),
                Timing::Sexp("(diary-float t 4 2)".into())
            );
            assert!(parse_timing("<2024-13-01 Mon>").is_err());
        }

        #[test]
        fn document_structure_settings_and_sections() {
            let text = "\
#+TITLE: Plans
#+TODO: TODO NEXT(n) | DONE(d)
#+PROPERTY: Color_ALL red green
Intro line
* NEXT Ship it
SCHEDULED: <2024-03-04 Mon> DEADLINE: <2024-03-08 Fri>
:PROPERTIES:
:Color: red
:END:
Body text
** Details
*** Deep
* Other
";
            let doc = parse_document(text).unwrap();
            assert_eq!(doc.settings.title.as_deref(), Some("Plans"));
            assert!(doc.settings.todo.is_keyword("NEXT"));
            assert_eq!(doc.settings.todo.by_fast_key('d'), Some("DONE"));

            let tree = doc.tree();
            let top = tree.children(tree.root());
            assert_eq!(top.len(), 2);
            let ship = tree.node(top[0]).unwrap();
            assert_eq!(ship.heading.as_ref().unwrap().keyword.as_deref(), Some("NEXT"));
            assert_eq!(ship.planning.len(), 2);
            assert_eq!(ship.properties.value("Color"), Some("red"));
            assert_eq!(
                ship.section.as_ref().unwrap().elements,
                vec![Element::Paragraph(vec!["Body text".into()])]
            );
            assert!(doc.validate_properties().is_empty());

            let root = tree.node(tree.root()).unwrap();
            assert_eq!(
                root.section.as_ref().unwrap().elements,
                vec![Element::Paragraph(vec!["Intro line".into()])]
            );
        }

        #[test]
        fn colliding_todo_keywords_fail_the_parse() {
            let text = "#+TODO: TODO | DONE\n#+TYP_TODO: BUG TODO | FIXED\n* TODO x\n";
            let err = parse_document(text).unwrap_err();
            assert!(err.chain().any(|c| {
                c.downcast_ref::<ConfigError>() == Some(&ConfigError::KeywordCollision("TODO".into()))
            }));
        }

        #[test]
        fn logbook_clocks_are_structured() {
            let text = "* Task\n:LOGBOOK:\nCLOCK: [2024-01-02 Tue 09:00]--[2024-01-02 Tue 10:30] =>  1:30\n- note\n:END:\n";
            let doc = parse_document(text).unwrap();
            let tree = doc.tree();
            let node = tree.node(tree.children(tree.root())[0]).unwrap();
            let Element::Drawer(drawer) = &node.section.as_ref().unwrap().elements[0] else {
                panic!("expected a drawer");
            };
            assert_eq!(drawer.name, "LOGBOOK");
            match &drawer.elements[0] {
                Element::Clock(clock) => assert_eq!(clock.duration().num_minutes(), 90),
                other => panic!("expected clock, got {other:?}"),
            }
            assert_eq!(drawer.elements[1], Element::Raw("- note".into()));
        }

        #[test]
        fn parse_file_reads_from_disk() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "* One\n** Two").unwrap();
            let doc = NomParser.parse_file(file.path()).unwrap();
            assert_eq!(doc.tree().len(), 2);
        }
    }
}

pub mod format {
    //! Renders documents back to Org text.
    //!
    //! Output is canonical: headline and planning spacing is normalised and buffer settings
    //! come first in a fixed order. Section content keeps its source lines.

    use crate::core::{ClockEntry, Element, Heading, HeadingPriority, Node, Property, PropertyDrawer, Tag};
    use crate::document::Document;
    use crate::settings::{BufferSettings, HeadingPrioritySetting, TodoKeyword, TodoSequence, TodoSettings};
    use crate::temporal::{
        IntervalUnit, Planning, PlanningKind, Repeat, RepeatKind, Timestamp, TimestampRange, Timing,
        WarningPeriod,
    };
    use std::fmt;

    /* --------------------------- Display impls --------------------------- */

    impl fmt::Display for Tag {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl fmt::Display for HeadingPriority {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Integer(n) => write!(f, "{n}"),
                Self::Alpha(c) => write!(f, "{c}"),
                Self::Unset => Ok(()),
            }
        }
    }

    impl fmt::Display for IntervalUnit {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.marker())
        }
    }

    impl fmt::Display for RepeatKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.marker())
        }
    }

    impl fmt::Display for WarningPeriod {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "-{}{}", self.amount, self.unit)
        }
    }

    impl fmt::Display for Repeat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}{}{}", self.kind, self.amount, self.unit)?;
            if let Some(window) = &self.agenda_window {
                write!(f, " {window}")?;
            }
            Ok(())
        }
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let (open, close) = if self.active { ('<', '>') } else { ('[', ']') };
            write!(f, "{open}{}", self.start.format("%Y-%m-%d %a"))?;
            if let Some(time) = self.time() {
                write!(f, " {}", time.format("%H:%M"))?;
                if let Some(end) = self.end_time() {
                    write!(f, "-{}", end.format("%H:%M"))?;
                }
            }
            if let Some(cookie) = self.cookie() {
                write!(f, " {cookie}")?;
            }
            write!(f, "{close}")
        }
    }

    impl fmt::Display for TimestampRange {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}--{}", self.start, self.end)
        }
    }

    impl fmt::Display for Timing {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Timestamp(ts) => write!(f, "{ts}"),
                Self::Range(r) => write!(f, "{r}"),
                Self::Sexp(expr) => write!(f, "<%%{expr}>"),
            }
        }
    }

    impl fmt::Display for Planning {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.kind.keyword() {
                Some(keyword) => write!(f, "{keyword}: {}", self.timing),
                None => write!(f, "{}", self.timing),
            }
        }
    }

    impl fmt::Display for Heading {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let mut parts: Vec<String> = Vec::new();
            if let Some(keyword) = &self.keyword {
                parts.push(keyword.clone());
            }
            if self.priority.is_set() {
                parts.push(format!("[#{}]", self.priority));
            }
            if self.commented {
                parts.push("COMMENT".to_string());
            }
            if !self.text.is_empty() {
                parts.push(self.text.clone());
            }
            if !self.tags.is_empty() {
                parts.push(format!(":{}:", join_tags(self.tags.iter())));
            }
            write!(f, "{} {}", "*".repeat(usize::from(self.level)), parts.join(" "))
        }
    }

    impl fmt::Display for Property {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            if self.value.is_empty() {
                write!(f, ":{}:", self.key)
            } else {
                write!(f, ":{}: {}", self.key, self.value)
            }
        }
    }

    impl fmt::Display for ClockEntry {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let start = Timestamp {
                end: None,
                ..self.range.clone()
            };
            write!(f, "CLOCK: {start}")?;
            if let Some(end) = self.range.end {
                let end = Timestamp {
                    start: end,
                    end: None,
                    repeat: None,
                    raw_cookie: None,
                    ..self.range.clone()
                };
                let minutes = self.duration().num_minutes();
                write!(f, "--{end} => {:>2}:{:02}", minutes / 60, minutes % 60)?;
            }
            Ok(())
        }
    }

    impl fmt::Display for TodoKeyword {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.fast_key {
                Some(key) => write!(f, "{}({key})", self.name),
                None => f.write_str(&self.name),
            }
        }
    }

    /// The directive line without its `#+` prefix: `TODO: TODO NEXT(n) | DONE(d)`.
    impl fmt::Display for TodoSequence {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let words = |ks: &[TodoKeyword]| ks.iter().map(|k| k.to_string()).collect::<Vec<_>>();
            let mut items = words(&self.active);
            items.push("|".to_string());
            items.extend(words(&self.done));
            write!(f, "{}: {}", self.kind.directive(), items.join(" "))
        }
    }

    fn join_tags<'a>(tags: impl Iterator<Item = &'a Tag>) -> String {
        tags.map(Tag::as_str).collect::<Vec<_>>().join(":")
    }

    /* ------------------------------ Writers ------------------------------ */

    /// Keyword planning on one line, then one line per plain timestamp.
    pub fn planning_lines(planning: &[Planning]) -> Vec<String> {
        let keyed: Vec<String> = planning
            .iter()
            .filter(|p| p.kind != PlanningKind::Event)
            .map(ToString::to_string)
            .collect();
        let mut lines = Vec::new();
        if !keyed.is_empty() {
            lines.push(keyed.join(" "));
        }
        lines.extend(
            planning
                .iter()
                .filter(|p| p.kind == PlanningKind::Event)
                .map(ToString::to_string),
        );
        lines
    }

    pub fn property_lines(drawer: &PropertyDrawer) -> Vec<String> {
        if drawer.is_empty() {
            return vec![];
        }
        let mut lines = vec![":PROPERTIES:".to_string()];
        lines.extend(drawer.iter().map(|p| p.to_string()));
        lines.push(":END:".to_string());
        lines
    }

    pub fn element_lines(element: &Element) -> Vec<String> {
        match element {
            Element::Paragraph(lines) => lines.clone(),
            Element::Drawer(drawer) => {
                let mut lines = vec![format!(":{}:", drawer.name)];
                for inner in &drawer.elements {
                    lines.extend(element_lines(inner));
                }
                lines.push(":END:".to_string());
                lines
            }
            Element::Clock(clock) => vec![clock.to_string()],
            Element::Keyword { key, value } if value.is_empty() => vec![format!("#+{key}:")],
            Element::Keyword { key, value } => vec![format!("#+{key}: {value}")],
            Element::Comment(line) | Element::Raw(line) => vec![line.clone()],
        }
    }

    pub fn node_lines(node: &Node) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(heading) = &node.heading {
            lines.push(heading.to_string());
        }
        lines.extend(planning_lines(&node.planning));
        lines.extend(property_lines(&node.properties));
        if let Some(section) = &node.section {
            for element in &section.elements {
                lines.extend(element_lines(element));
            }
        }
        lines
    }

    /// `#+KEY:` lines for every setting that differs from the stock defaults.
    pub fn settings_lines(settings: &BufferSettings) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(title) = &settings.title {
            lines.push(format!("#+TITLE: {title}"));
        }
        if !settings.file_tags.is_empty() {
            lines.push(format!("#+FILETAGS: :{}:", join_tags(settings.file_tags.iter())));
        }
        if settings.todo != TodoSettings::standard() {
            for sequence in settings.todo.sequences() {
                lines.push(format!("#+{sequence}"));
            }
        }
        if settings.priorities != HeadingPrioritySetting::default() {
            let p = &settings.priorities;
            lines.push(format!("#+PRIORITIES: {} {} {}", p.highest, p.lowest, p.default));
        }
        for property in settings.properties.iter() {
            lines.push(
                format!("#+PROPERTY: {} {}", property.key, property.value)
                    .trim_end()
                    .to_string(),
            );
        }
        for (key, value) in [
            ("CATEGORY", &settings.category),
            ("ARCHIVE", &settings.archive),
            ("COLUMNS", &settings.columns),
        ] {
            if let Some(value) = value {
                lines.push(format!("#+{key}: {value}"));
            }
        }
        if !settings.constants.is_empty() {
            let pairs: Vec<String> = settings
                .constants
                .iter()
                .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
                .collect();
            lines.push(format!("#+CONSTANTS: {}", pairs.join(" ")));
        }
        for (name, target) in &settings.links {
            lines.push(format!("#+LINK: {name} {target}"));
        }
        lines
    }

    /// The whole document as Org text, newline-terminated.
    pub fn format_document(document: &Document) -> String {
        let mut lines = settings_lines(&document.settings);
        let tree = document.tree();
        if let Some(root) = tree.node(tree.root()) {
            lines.extend(node_lines(root));
        }
        for (_, node) in tree.iter() {
            lines.extend(node_lines(node));
        }
        let mut out = lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::parse_document;
        use chrono::NaiveDate;

        #[test]
        fn formatter_round_trips_canonical_text() {
            let text = "\
#+TITLE: Demo
#+FILETAGS: :home:
#+TODO: TODO NEXT(n) | DONE(d)
Preamble paragraph
* TODO [#A] Pay rent :money:
DEADLINE: <2024-01-31 Wed +1m>
:PROPERTIES:
:Owner: me
:END:
Some notes

** NEXT Call bank
SCHEDULED: <2024-01-15 Mon 10:00-10:30>
# remember the account number
* COMMENT Holiday
<2024-07-01 Mon>--<2024-07-10 Wed>
:LOGBOOK:
CLOCK: [2024-01-02 Tue 09:00]--[2024-01-02 Tue 10:30] =>  1:30
:END:
#+STARTUP: overview
";
            let doc = parse_document(text).unwrap();
            assert_eq!(format_document(&doc), text);
        }

        #[test]
        fn built_document_renders_stably() {
            let mut doc = Document::new();
            let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
            doc.append_node(
                Node::new(
                    Heading::new(1, "Weekly review")
                        .with_keyword("TODO")
                        .with_tags(["work", "review"]),
                )
                .with_planning(Planning::scheduled(Timestamp::on_date(day).with_repeat(
                    Repeat::new(RepeatKind::ShiftFutureFixed, 1, IntervalUnit::Week)
                        .with_agenda_window(2, IntervalUnit::Day),
                ))),
            )
            .unwrap();
            assert_eq!(
                format_document(&doc),
                "* TODO Weekly review :work:review:\nSCHEDULED: <2024-03-04 Mon ++1w -2d>\n"
            );

            let reparsed = parse_document(&format_document(&doc)).unwrap();
            assert_eq!(format_document(&reparsed), format_document(&doc));
        }

        #[test]
        fn non_default_priorities_and_properties_are_written() {
            let mut settings = BufferSettings {
                priorities: HeadingPrioritySetting::numeric(),
                ..BufferSettings::default()
            };
            settings.properties.set(Property::new("Color_ALL", "red green"));
            assert_eq!(
                settings_lines(&settings),
                vec!["#+PRIORITIES: 1 64 32", "#+PROPERTY: Color_ALL red green"]
            );
        }

        #[test]
        fn sexp_and_inactive_stamps_render() {
            assert_eq!(Timing::Sexp("(diary-float t 4 2)".into()).to_string(), "<%%(diary-float t 4 2)>");
            let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
            assert_eq!(Timestamp::on_date(day).inactive().to_string(), "[2024-02-29 Thu]");
        }
    }
}

pub use crate::agenda::{AgendaItem, AgendaRange, occurrences, project};
pub use crate::core::{
    ClockEntry, DocumentId, Drawer, Element, Heading, HeadingPriority, HeadingPriorityKind, Node,
    OrgError, Property, PropertyDrawer, PropertyError, Section, Tag,
};
pub use crate::document::Document;
pub use crate::format::format_document;
pub use crate::parser::{DocumentParser, NomParser, parse_document, parse_timing};
pub use crate::repeat::{RepeatConfig, RepeatError, RepeatStamp, Repeater};
pub use crate::settings::{
    BufferSettings, ConfigError, HeadingPrioritySetting, PropertyInheritance, TagInheritance,
    TodoKeyword, TodoSequence, TodoSequenceKind, TodoSettings,
};
pub use crate::temporal::{
    IntervalUnit, Planning, PlanningKind, RangeDuration, Repeat, RepeatKind, TemporalError,
    Timestamp, TimestampRange, Timing, TimingKind, WarningPeriod,
};
pub use crate::tree::{OutlineTree, PositionId, TreeError};
