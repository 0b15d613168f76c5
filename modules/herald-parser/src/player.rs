use std::sync::LazyLock;

use regex::Regex;

use crate::html::strip_tags;

static ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").expect("valid regex"));
static CELL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<t[dh][^>]*>(.*?)</t[dh]>").expect("valid regex"));

/// Extract lifetime realm points from a leaderboard profile page.
///
/// Looks for a table row whose label cell normalizes to "realmpoints" and
/// reads the digits of the adjacent cell. Returns `None` when no such row
/// exists or the value cell carries no digits.
pub fn parse_realm_points(html: &str) -> Option<u64> {
    for row in ROW_RE.captures_iter(html) {
        let cells: Vec<String> = CELL_RE
            .captures_iter(&row[1])
            .map(|c| strip_tags(&c[1]))
            .collect();

        for (i, cell) in cells.iter().enumerate() {
            let label: String = cell
                .chars()
                .filter(|c| c.is_ascii_alphabetic())
                .collect::<String>()
                .to_lowercase();
            if label != "realmpoints" {
                continue;
            }
            let digits: String = cells
                .get(i + 1)?
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect();
            if digits.is_empty() {
                return None;
            }
            return digits.parse().ok();
        }
    }
    None
}
