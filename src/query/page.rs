use serde::{Deserialize, Serialize};

use crate::core::{DbError, Result};
pub use crate::statement::Direction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Entity field name, e.g. `username`.
    pub property: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub orders: Vec<Order>,
}

impl Sort {
    pub fn by(direction: Direction, properties: &[&str]) -> Self {
        Self {
            orders: properties
                .iter()
                .map(|property| Order {
                    property: property.to_string(),
                    direction,
                })
                .collect(),
        }
    }

    pub fn unsorted() -> Self {
        Self::default()
    }

    pub fn is_unsorted(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn and(mut self, other: Sort) -> Self {
        self.orders.extend(other.orders);
        self
    }

    /// Parses `property[,asc|desc]` terms separated by `;`, e.g.
    /// `username,desc;age`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut orders = Vec::new();
        for term in text.split(';').map(str::trim).filter(|term| !term.is_empty()) {
            let mut parts = term.split(',').map(str::trim);
            let property = parts.next().unwrap_or_default();
            if property.is_empty() {
                return Err(DbError::Validation(format!("Empty sort property in '{}'", text)));
            }
            let direction = match parts.next().map(str::to_ascii_lowercase).as_deref() {
                None | Some("asc") => Direction::Asc,
                Some("desc") => Direction::Desc,
                Some(other) => {
                    return Err(DbError::Validation(format!(
                        "Unknown sort direction '{}' for '{}'",
                        other, property
                    )));
                }
            };
            orders.push(Order {
                property: property.to_string(),
                direction,
            });
        }
        Ok(Self { orders })
    }
}

/// Zero-based page index, page size and an optional sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    page: usize,
    size: usize,
    sort: Sort,
}

impl PageRequest {
    pub fn of(page: usize, size: usize) -> Self {
        Self {
            page,
            size,
            sort: Sort::unsorted(),
        }
    }

    pub fn sorted(page: usize, size: usize, sort: Sort) -> Self {
        Self { page, size, sort }
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn sort(&self) -> &Sort {
        &self.sort
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_mul(self.size)
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page.saturating_add(1),
            ..self.clone()
        }
    }
}

/// One window of a larger result plus the totals needed to navigate it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    content: Vec<T>,
    number: usize,
    size: usize,
    total_elements: u64,
    total_pages: usize,
    first: bool,
    last: bool,
}

impl<T> Page<T> {
    pub fn new(content: Vec<T>, number: usize, size: usize, total_elements: u64) -> Self {
        let total_pages = if size == 0 {
            1
        } else {
            (total_elements as usize).div_ceil(size)
        };
        Self {
            content,
            number,
            size,
            total_elements,
            total_pages,
            first: number == 0,
            last: number.saturating_add(1) >= total_pages,
        }
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn number_of_elements(&self) -> usize {
        self.content.len()
    }

    pub fn total_elements(&self) -> u64 {
        self.total_elements
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    pub fn is_first(&self) -> bool {
        self.first
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    pub fn has_next(&self) -> bool {
        self.number.saturating_add(1) < self.total_pages
    }

    pub fn has_previous(&self) -> bool {
        self.number > 0
    }

    /// Converts the content, keeping the paging totals.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            number: self.number,
            size: self.size,
            total_elements: self.total_elements,
            total_pages: self.total_pages,
            first: self.first,
            last: self.last,
        }
    }
}
