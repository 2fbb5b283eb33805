//! The page-numbering filename grammar.
//!
//! Scans are expected to have been renamed to one of four shapes:
//!
//! | Mode   | Arabic             | Roman                |
//! |--------|--------------------|----------------------|
//! | dual   | `Page-004-005.jpg` | `Page-r-iv-v.jpg`    |
//! | single | `Page-004.jpg`     | `Page-r-iv.jpg`      |
//!
//! Any of these may carry a one-letter suffix before the extension
//! (`Page-004-005-a.jpg`), used for image-only spreads that share the
//! numbers of the preceding page. The extension is `jpg` or `jpeg` in any
//! case; everything else is case-sensitive.
//!
//! A Roman group is any run of `ivxlcdm`. Non-canonical numerals such as
//! `iiii` still match and are shown exactly as written.

use std::{fmt, sync::LazyLock};

use regex::{Captures, Regex};

use crate::{config::ScanMode, prelude::*, roman::from_roman};

static DUAL_ARABIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Page-([0-9]{3})-([0-9]{3})(?:-([a-zA-Z]))?\.(?i:jpe?g)$")
        .expect("failed to compile regex")
});

static DUAL_ROMAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Page-r-([ivxlcdm]+)-([ivxlcdm]+)(?:-([a-zA-Z]))?\.(?i:jpe?g)$")
        .expect("failed to compile regex")
});

static SINGLE_ARABIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Page-([0-9]{3})(?:-([a-zA-Z]))?\.(?i:jpe?g)$")
        .expect("failed to compile regex")
});

static SINGLE_ROMAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Page-r-([ivxlcdm]+)(?:-([a-zA-Z]))?\.(?i:jpe?g)$")
        .expect("failed to compile regex")
});

/// A page number taken from a filename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageLabel {
    /// A body page. Leading zeros are dropped.
    Arabic(u32),
    /// A front-matter page, kept exactly as written.
    Roman(String),
}

impl PageLabel {
    /// Parse a zero-padded digit group, so `"007"` becomes `7` and `"000"`
    /// becomes `0`.
    pub fn from_digits(digits: &str) -> Option<Self> {
        digits.parse().ok().map(PageLabel::Arabic)
    }

    /// Accept a Roman numeral group as written.
    pub fn from_numeral(numeral: &str) -> Self {
        if from_roman(numeral).is_none() {
            trace!(numeral, "Page label is not a canonical Roman numeral");
        }
        PageLabel::Roman(numeral.to_owned())
    }

    /// The heading printed at the top of the output page.
    pub fn heading(&self) -> String {
        format!("Page {self}")
    }
}

impl fmt::Display for PageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageLabel::Arabic(n) => write!(f, "{n}"),
            PageLabel::Roman(s) => write!(f, "{s}"),
        }
    }
}

/// Which of the four filename shapes matched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    DualArabic,
    DualRoman,
    SingleArabic,
    SingleRoman,
}

/// A classified scan filename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageName {
    /// Two facing pages in one image.
    Dual {
        left: PageLabel,
        right: PageLabel,
        suffix: Option<char>,
    },
    /// One page per image.
    Single {
        page: PageLabel,
        suffix: Option<char>,
    },
}

impl PageName {
    /// Classify `file_name` using the grammar for `mode`. Names that don't
    /// fit return `None`.
    pub fn classify(file_name: &str, mode: ScanMode) -> Option<Self> {
        match mode {
            ScanMode::Dual => {
                if let Some(caps) = DUAL_ARABIC.captures(file_name) {
                    Some(PageName::Dual {
                        left: PageLabel::from_digits(&caps[1])?,
                        right: PageLabel::from_digits(&caps[2])?,
                        suffix: suffix(&caps, 3),
                    })
                } else if let Some(caps) = DUAL_ROMAN.captures(file_name) {
                    Some(PageName::Dual {
                        left: PageLabel::from_numeral(&caps[1]),
                        right: PageLabel::from_numeral(&caps[2]),
                        suffix: suffix(&caps, 3),
                    })
                } else {
                    None
                }
            }
            ScanMode::Single => {
                if let Some(caps) = SINGLE_ARABIC.captures(file_name) {
                    Some(PageName::Single {
                        page: PageLabel::from_digits(&caps[1])?,
                        suffix: suffix(&caps, 2),
                    })
                } else if let Some(caps) = SINGLE_ROMAN.captures(file_name) {
                    Some(PageName::Single {
                        page: PageLabel::from_numeral(&caps[1]),
                        suffix: suffix(&caps, 2),
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Which filename shape this is.
    pub fn kind(&self) -> PageKind {
        match self {
            PageName::Dual {
                left: PageLabel::Roman(_),
                ..
            } => PageKind::DualRoman,
            PageName::Dual { .. } => PageKind::DualArabic,
            PageName::Single {
                page: PageLabel::Roman(_),
                ..
            } => PageKind::SingleRoman,
            PageName::Single { .. } => PageKind::SingleArabic,
        }
    }

    /// Page labels in output order: left then right, or the single page.
    pub fn labels(&self) -> Vec<&PageLabel> {
        match self {
            PageName::Dual { left, right, .. } => vec![left, right],
            PageName::Single { page, .. } => vec![page],
        }
    }
}

fn suffix(caps: &Captures<'_>, group: usize) -> Option<char> {
    caps.get(group).and_then(|m| m.as_str().chars().next())
}

/// What we tell the user when nothing in the directory matches.
pub fn expected_shape(mode: ScanMode) -> &'static str {
    match mode {
        ScanMode::Dual => "dual-page: Page-NNN-NNN or Page-r-xxx-xxx format",
        ScanMode::Single => "single-page: Page-NNN or Page-r-xxx format",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arabic(n: u32) -> PageLabel {
        PageLabel::Arabic(n)
    }

    fn roman(s: &str) -> PageLabel {
        PageLabel::Roman(s.to_owned())
    }

    #[test]
    fn test_dual_names() {
        assert_eq!(
            PageName::classify("Page-004-005.jpg", ScanMode::Dual),
            Some(PageName::Dual {
                left: arabic(4),
                right: arabic(5),
                suffix: None
            })
        );
        assert_eq!(
            PageName::classify("Page-r-iv-v-a.JPEG", ScanMode::Dual),
            Some(PageName::Dual {
                left: roman("iv"),
                right: roman("v"),
                suffix: Some('a')
            })
        );
        assert_eq!(
            PageName::classify("Page-000-001-B.Jpg", ScanMode::Dual)
                .unwrap()
                .kind(),
            PageKind::DualArabic
        );
    }

    #[test]
    fn test_single_names() {
        assert_eq!(
            PageName::classify("Page-010.jpg", ScanMode::Single),
            Some(PageName::Single {
                page: arabic(10),
                suffix: None
            })
        );
        assert_eq!(
            PageName::classify("Page-r-xiv-c.jpg", ScanMode::Single)
                .unwrap()
                .kind(),
            PageKind::SingleRoman
        );
    }

    #[test]
    fn test_non_matching_names_are_excluded() {
        let dual_rejects = [
            "Page-invalid.jpg",
            "Page-001.jpg",
            "Page-01-002.jpg",
            "Page-0001-002.jpg",
            "page-001-002.jpg",
            "Page-001-002.png",
            "Page-001-002-ab.jpg",
            "Page-001-002-1.jpg",
            "Page-R-iv-v.jpg",
            "Page-r-IV-V.jpg",
            "Page-r-iv-5.jpg",
            "Page-001-002.jpg.bak",
            "xPage-001-002.jpg",
            "Page-١٢٣-002.jpg",
        ];
        for name in dual_rejects {
            assert_eq!(PageName::classify(name, ScanMode::Dual), None, "{name}");
        }

        let single_rejects = [
            "Page-001-002.jpg",
            "Page-01.jpg",
            "Page-001.tif",
            "Page-r-.jpg",
            "Page-r-xiv-cd.jpg",
            "Page-001-.jpg",
        ];
        for name in single_rejects {
            assert_eq!(PageName::classify(name, ScanMode::Single), None, "{name}");
        }
    }

    #[test]
    fn test_non_canonical_numerals_are_kept_verbatim() {
        assert_eq!(
            PageName::classify("Page-r-iiii-v.jpg", ScanMode::Dual),
            Some(PageName::Dual {
                left: roman("iiii"),
                right: roman("v"),
                suffix: None
            })
        );
        assert_eq!(
            PageName::classify("Page-r-ic-x.jpg", ScanMode::Dual)
                .unwrap()
                .labels()[0]
                .heading(),
            "Page ic"
        );
        assert_eq!(
            PageName::classify("Page-r-mmmm.jpg", ScanMode::Single),
            Some(PageName::Single {
                page: roman("mmmm"),
                suffix: None
            })
        );
    }

    #[test]
    fn test_modes_do_not_cross_match_arabic() {
        assert!(PageName::classify("Page-001.jpg", ScanMode::Dual).is_none());
        assert!(PageName::classify("Page-001-002.jpg", ScanMode::Single).is_none());
    }

    #[test]
    fn test_headings() {
        let name = PageName::classify("Page-000-007.jpg", ScanMode::Dual).unwrap();
        let headings = name
            .labels()
            .into_iter()
            .map(PageLabel::heading)
            .collect::<Vec<_>>();
        assert_eq!(headings, vec!["Page 0", "Page 7"]);

        let name = PageName::classify("Page-r-xl.jpeg", ScanMode::Single).unwrap();
        assert_eq!(name.labels()[0].heading(), "Page xl");
    }

    #[test]
    fn test_arabic_labels_round_trip_after_zero_stripping() {
        for n in 0..1000u32 {
            let label = PageLabel::from_digits(&format!("{n:03}")).unwrap();
            let shown = label.to_string();
            assert_eq!(shown, n.to_string());
            assert_eq!(PageLabel::from_digits(&shown), Some(label));
        }
    }
}
