//! Skip-list and include-filter predicates on customer identifiers.

/// One filter entry: exact identifier, or prefix when written with a trailing `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerPattern {
    Exact(String),
    Prefix(String),
}

impl CustomerPattern {
    /// A trailing `*` makes a prefix pattern; anything else matches exactly.
    pub fn parse(entry: &str) -> Self {
        let entry = entry.trim();
        match entry.strip_suffix('*') {
            Some(prefix) => CustomerPattern::Prefix(prefix.to_string()),
            None => CustomerPattern::Exact(entry.to_string()),
        }
    }

    pub fn matches(&self, customer: &str) -> bool {
        match self {
            CustomerPattern::Exact(id) => id == customer,
            CustomerPattern::Prefix(prefix) => customer.starts_with(prefix.as_str()),
        }
    }
}

/// Combined skip and include predicates.
///
/// Skip wins over include. An empty include list admits everyone.
#[derive(Debug, Clone, Default)]
pub struct CustomerFilter {
    skip: Vec<CustomerPattern>,
    include: Vec<CustomerPattern>,
}

impl CustomerFilter {
    pub fn new(skip: &[String], include: &[String]) -> Self {
        let parse = |entries: &[String]| {
            entries
                .iter()
                .filter(|e| !e.trim().is_empty())
                .map(|e| CustomerPattern::parse(e))
                .collect()
        };
        Self {
            skip: parse(skip),
            include: parse(include),
        }
    }

    /// Not skipped, and included when an include list is set.
    pub fn allows(&self, customer: &str) -> bool {
        if self.skip.iter().any(|p| p.matches(customer)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.matches(customer))
    }

    pub fn is_empty(&self) -> bool {
        self.skip.is_empty() && self.include.is_empty()
    }

    /// Short description stored on customer rows, `None` when unfiltered.
    pub fn describe(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let render = |patterns: &[CustomerPattern]| {
            patterns
                .iter()
                .map(|p| match p {
                    CustomerPattern::Exact(id) => id.clone(),
                    CustomerPattern::Prefix(prefix) => format!("{}*", prefix),
                })
                .collect::<Vec<_>>()
                .join(",")
        };
        let mut parts = Vec::new();
        if !self.include.is_empty() {
            parts.push(format!("include={}", render(&self.include)));
        }
        if !self.skip.is_empty() {
            parts.push(format!("skip={}", render(&self.skip)));
        }
        Some(parts.join(";"))
    }
}
