//! PDF output, using `lopdf`.
//!
//! Each output page is an A4 page with a small heading and the page text.
//! By default we set text in Helvetica, which limits it to the WinAnsi
//! character set; anything else is replaced with `?`. Given a TrueType font,
//! we embed it as a `Type0` font addressed by glyph ID instead, so any
//! script the font covers comes out intact.

use std::collections::BTreeMap;

use lopdf::{Document, Object, ObjectId, Stream, dictionary};
use ttf_parser::{Face, GlyphId};

use crate::{
    async_utils::io::write_file_atomic_blocking, prelude::*,
    queues::ocr::partition::PageText,
};

use super::{PageEmitter, font::TrueTypeFont};

/// Replacement for characters that WinAnsi can't represent.
const REPLACEMENT: u8 = b'?';

/// Line height as a multiple of the font size.
const LEADING: f32 = 1.2;

/// Page geometry and font sizes, in points.
#[derive(Clone, Debug)]
pub struct PageLayout {
    pub width: f32,
    pub height: f32,
    pub margin: f32,
    pub heading_size: f32,
    pub body_size: f32,
    pub min_body_size: f32,
}

impl Default for PageLayout {
    /// A4 with 15mm margins.
    fn default() -> Self {
        Self {
            width: 595.0,
            height: 842.0,
            margin: 42.52,
            heading_size: 10.0,
            body_size: 12.0,
            min_body_size: 6.0,
        }
    }
}

/// Body text, wrapped and sized to fit a page.
#[derive(Debug)]
struct BodyLayout {
    font_size: f32,
    lines: Vec<String>,
    /// Lines that didn't fit, even at the smallest font size.
    clipped: usize,
}

impl PageLayout {
    fn text_width(&self) -> f32 {
        self.width - 2.0 * self.margin
    }

    fn heading_baseline(&self) -> f32 {
        self.height - self.margin - self.heading_size
    }

    fn body_top(&self) -> f32 {
        self.heading_baseline() - self.heading_size
    }

    /// Wrap `text` at the largest font size that fits, shrinking one point
    /// at a time down to `min_body_size`.
    fn layout_body(&self, text: &str, typeface: &Typeface<'_>) -> BodyLayout {
        let available = self.body_top() - self.margin;
        let mut font_size = self.body_size;
        loop {
            let lines = wrap_text(text, self.text_width(), font_size, typeface);
            let max_lines = (available / (font_size * LEADING)).floor().max(0.0) as usize;
            if lines.len() <= max_lines {
                return BodyLayout {
                    font_size,
                    lines,
                    clipped: 0,
                };
            }
            if font_size - 1.0 < self.min_body_size {
                let clipped = lines.len() - max_lines;
                let mut lines = lines;
                lines.truncate(max_lines);
                return BodyLayout {
                    font_size,
                    lines,
                    clipped,
                };
            }
            font_size -= 1.0;
        }
    }
}

/// A glyph an embedded font has been used for.
#[derive(Clone, Copy, Debug)]
struct UsedGlyph {
    /// Advance width, in 1/1000 em.
    width: u32,
    /// The character it was used for.
    ch: char,
}

/// How we measure and encode text for one document.
enum Typeface<'a> {
    /// Helvetica, with WinAnsi encoding.
    Helvetica,
    /// An embedded TrueType font. Text is written as 2-byte glyph IDs.
    TrueType {
        font: &'a TrueTypeFont,
        face: Face<'a>,
        /// Every glyph written so far, by glyph ID.
        used: BTreeMap<u16, UsedGlyph>,
    },
}

impl<'a> Typeface<'a> {
    fn for_font(font: Option<&'a TrueTypeFont>) -> Result<Self> {
        Ok(match font {
            Some(font) => Typeface::TrueType {
                font,
                face: font.face()?,
                used: BTreeMap::new(),
            },
            None => Typeface::Helvetica,
        })
    }

    /// Advance width of `c`, in 1/1000 em.
    fn char_width(&self, c: char) -> u32 {
        match self {
            Typeface::Helvetica => helvetica_width(win_ansi_byte(c)),
            Typeface::TrueType { face, .. } => glyph_width(face, glyph_id(face, c)),
        }
    }

    /// Width of `text` in points at `font_size`.
    fn text_width(&self, text: &str, font_size: f32) -> f32 {
        text.chars()
            .map(|c| self.char_width(c) as f32 * font_size / 1000.0)
            .sum()
    }

    /// Append `text` to a content stream as a string operand.
    fn push_text(&mut self, out: &mut Vec<u8>, text: &str) {
        match self {
            Typeface::Helvetica => push_string_literal(out, &encode_win_ansi(text)),
            Typeface::TrueType { face, used, .. } => {
                let face: &Face<'_> = face;
                out.push(b'<');
                for c in text.chars() {
                    let gid = glyph_id(face, c);
                    used.entry(gid.0).or_insert_with(|| UsedGlyph {
                        width: glyph_width(face, gid),
                        ch: c,
                    });
                    out.extend_from_slice(format!("{:04X}", gid.0).as_bytes());
                }
                out.push(b'>');
            }
        }
    }
}

/// Writes one PDF per image, one page per output page.
#[derive(Debug, Default)]
pub struct PdfEmitter {
    layout: PageLayout,
    /// Embedded in every document when present.
    font: Option<TrueTypeFont>,
}

impl PdfEmitter {
    /// An emitter that embeds `font`, or uses Helvetica if it is `None`.
    pub fn with_font(font: Option<TrueTypeFont>) -> Self {
        Self {
            font,
            ..Self::default()
        }
    }

    /// Build a PDF document for `pages`.
    fn build_document(&self, pages: &[PageText]) -> Result<Document> {
        let mut typeface = Typeface::for_font(self.font.as_ref())?;
        let contents = pages
            .iter()
            .map(|page| self.page_content(page, &mut typeface))
            .collect::<Vec<_>>();

        let mut doc = Document::with_version("1.5");
        let (body_font_id, heading_font_id) = match &typeface {
            Typeface::Helvetica => (
                doc.add_object(standard_font("Helvetica")),
                doc.add_object(standard_font("Helvetica-Bold")),
            ),
            Typeface::TrueType { font, face, used } => {
                let font_id = add_type0_font(&mut doc, font, face, used)?;
                (font_id, font_id)
            }
        };
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => body_font_id,
                "F2" => heading_font_id,
            },
        });

        let mut page_ids = vec![];
        for content in contents {
            let content_id = doc.add_object(Stream::new(dictionary! {}, content));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "MediaBox" => vec![
                    0.into(),
                    0.into(),
                    (self.layout.width as i64).into(),
                    (self.layout.height as i64).into(),
                ],
                "Resources" => resources_id,
                "Contents" => content_id,
            });
            page_ids.push(page_id);
        }
        finish_page_tree(&mut doc, &page_ids)?;
        Ok(doc)
    }

    /// The content stream for a single page.
    fn page_content(&self, page: &PageText, typeface: &mut Typeface<'_>) -> Vec<u8> {
        let layout = &self.layout;
        let mut out = Vec::new();

        let heading = clean_text(&page.heading);
        if !heading.is_empty() {
            out.extend_from_slice(
                format!(
                    "BT /F2 {} Tf {:.2} {:.2} Td ",
                    layout.heading_size,
                    layout.margin,
                    layout.heading_baseline()
                )
                .as_bytes(),
            );
            typeface.push_text(&mut out, &heading);
            out.extend_from_slice(b" Tj ET\n");
        }

        let body = layout.layout_body(&clean_text(&page.text), typeface);
        if body.clipped > 0 {
            warn!(
                heading = %page.heading,
                clipped = body.clipped,
                "Text does not fit on page, dropping lines"
            );
        }
        if !body.lines.is_empty() {
            out.extend_from_slice(
                format!(
                    "BT /F1 {} Tf {:.2} TL {:.2} {:.2} Td\n",
                    body.font_size,
                    body.font_size * LEADING,
                    layout.margin,
                    layout.body_top() - body.font_size,
                )
                .as_bytes(),
            );
            for (idx, line) in body.lines.iter().enumerate() {
                if idx > 0 {
                    out.extend_from_slice(b"T* ");
                }
                typeface.push_text(&mut out, line);
                out.extend_from_slice(b" Tj\n");
            }
            out.extend_from_slice(b"ET\n");
        }
        out
    }
}

impl PageEmitter for PdfEmitter {
    #[instrument(level = "debug", skip_all, fields(path = %output_path.display()))]
    fn emit(&self, output_path: &Path, pages: &[PageText]) -> Result<()> {
        let mut doc = self.build_document(pages)?;
        save_atomic(&mut doc, output_path)
    }

    #[instrument(level = "debug", skip_all, fields(path = %merged_path.display()))]
    fn merge(&self, inputs: &[PathBuf], merged_path: &Path) -> Result<()> {
        let mut merged = Document::with_version("1.5");
        let mut page_ids = vec![];
        for input in inputs {
            let mut doc = Document::load(input)
                .with_context(|| format!("Failed to load PDF {:?}", input))?;
            doc.renumber_objects_with(merged.max_id + 1);
            merged.max_id = doc.max_id;
            page_ids.extend(doc.get_pages().into_values());
            merged.objects.extend(doc.objects);
        }
        finish_page_tree(&mut merged, &page_ids)?;
        merged.prune_objects();
        save_atomic(&mut merged, merged_path)
    }
}

/// A standard Type 1 font with WinAnsi encoding.
fn standard_font(name: &str) -> lopdf::Dictionary {
    dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => name,
        "Encoding" => "WinAnsiEncoding",
    }
}

/// Embed `font` as a `Type0` font with `Identity-H` encoding, so that
/// character codes in content streams are glyph IDs. The width array and
/// `ToUnicode` map cover the glyphs in `used`.
fn add_type0_font(
    doc: &mut Document,
    font: &TrueTypeFont,
    face: &Face<'_>,
    used: &BTreeMap<u16, UsedGlyph>,
) -> Result<ObjectId> {
    let units_per_em = f32::from(face.units_per_em().max(1));
    let scaled = |v: i16| (f32::from(v) * 1000.0 / units_per_em).round() as i64;

    // TODO: Subset the font to `used`. A full CJK font adds megabytes to
    // every page file.
    let mut font_file = Stream::new(
        dictionary! { "Length1" => font.data().len() as i64 },
        font.data().to_vec(),
    );
    font_file
        .compress()
        .with_context(|| format!("Failed to compress font {:?}", font.path()))?;
    let font_file_id = doc.add_object(font_file);

    let bbox = face.global_bounding_box();
    let descriptor_id = doc.add_object(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => font.base_name(),
        "Flags" => 4,
        "FontBBox" => vec![
            scaled(bbox.x_min).into(),
            scaled(bbox.y_min).into(),
            scaled(bbox.x_max).into(),
            scaled(bbox.y_max).into(),
        ],
        "ItalicAngle" => 0,
        "Ascent" => scaled(face.ascender()),
        "Descent" => scaled(face.descender()),
        "CapHeight" => scaled(face.capital_height().unwrap_or_else(|| face.ascender())),
        "StemV" => 80,
        "FontFile2" => font_file_id,
    });

    let cid_font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType2",
        "BaseFont" => font.base_name(),
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("Identity"),
            "Supplement" => 0,
        },
        "FontDescriptor" => descriptor_id,
        "W" => glyph_widths_array(used),
        "CIDToGIDMap" => "Identity",
    });

    let to_unicode_id = doc.add_object(Stream::new(dictionary! {}, to_unicode_cmap(used)));
    Ok(doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => font.base_name(),
        "Encoding" => "Identity-H",
        "DescendantFonts" => vec![cid_font_id.into()],
        "ToUnicode" => to_unicode_id,
    }))
}

/// A CID font `W` array, with one entry per run of consecutive glyph IDs.
fn glyph_widths_array(used: &BTreeMap<u16, UsedGlyph>) -> Vec<Object> {
    let mut runs: Vec<(u16, Vec<Object>)> = vec![];
    for (&gid, glyph) in used {
        match runs.last_mut() {
            Some((first, widths)) if usize::from(*first) + widths.len() == usize::from(gid) => {
                widths.push(glyph.width.into());
            }
            _ => runs.push((gid, vec![glyph.width.into()])),
        }
    }
    runs.into_iter()
        .flat_map(|(first, widths)| [Object::from(first), Object::from(widths)])
        .collect()
}

/// A `ToUnicode` CMap mapping each used glyph back to its character, so
/// that text can be searched and copied. `.notdef` is left unmapped.
fn to_unicode_cmap(used: &BTreeMap<u16, UsedGlyph>) -> Vec<u8> {
    let mut cmap = String::from(
        "/CIDInit /ProcSet findresource begin\n\
         12 dict begin\n\
         begincmap\n\
         /CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n\
         /CMapName /Adobe-Identity-UCS def\n\
         /CMapType 2 def\n\
         1 begincodespacerange\n\
         <0000> <FFFF>\n\
         endcodespacerange\n",
    );
    let mapped = used.iter().filter(|(gid, _)| **gid != 0).collect::<Vec<_>>();
    // At most 100 entries per block.
    for chunk in mapped.chunks(100) {
        cmap.push_str(&format!("{} beginbfchar\n", chunk.len()));
        for (gid, glyph) in chunk {
            let mut units = [0u16; 2];
            let utf16 = glyph
                .ch
                .encode_utf16(&mut units)
                .iter()
                .map(|unit| format!("{unit:04X}"))
                .collect::<String>();
            cmap.push_str(&format!("<{gid:04X}> <{utf16}>\n"));
        }
        cmap.push_str("endbfchar\n");
    }
    cmap.push_str("endcmap\nCMapName currentdict /CMap defineresource pop\nend\nend\n");
    cmap.into_bytes()
}

/// Add a page tree and catalog containing `page_ids`, in order.
fn finish_page_tree(doc: &mut Document, page_ids: &[ObjectId]) -> Result<()> {
    let kids = page_ids.iter().map(|&id| id.into()).collect::<Vec<Object>>();
    let pages_id = doc.add_object(dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => Object::Integer(page_ids.len() as i64),
    });
    for &page_id in page_ids {
        let page = doc
            .get_object_mut(page_id)
            .and_then(Object::as_dict_mut)
            .with_context(|| format!("PDF page {:?} is not a dictionary", page_id))?;
        page.set("Parent", pages_id);
    }
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    Ok(())
}

/// Serialize `doc` and write it atomically.
fn save_atomic(doc: &mut Document, path: &Path) -> Result<()> {
    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .with_context(|| format!("Failed to serialize PDF {:?}", path))?;
    write_file_atomic_blocking(path, &buffer)
}

/// Drop `\r` and turn tabs into spaces. `\n` separates lines.
fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|&c| c != '\r')
        .map(|c| if c == '\t' { ' ' } else { c })
        .collect()
}

/// Write `text` as a PDF string literal, with escapes.
fn push_string_literal(out: &mut Vec<u8>, text: &[u8]) {
    out.push(b'(');
    for &b in text {
        if matches!(b, b'(' | b')' | b'\\') {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b')');
}

/// Encode `text` as WinAnsi.
fn encode_win_ansi(text: &str) -> Vec<u8> {
    text.chars().map(win_ansi_byte).collect()
}

/// The WinAnsi code for `c`, or [`REPLACEMENT`].
fn win_ansi_byte(c: char) -> u8 {
    match c {
        '\n' => b'\n',
        ' '..='~' => c as u8,
        '\u{a0}'..='\u{ff}' => c as u32 as u8,
        '€' => 0x80,
        '‚' => 0x82,
        'ƒ' => 0x83,
        '„' => 0x84,
        '…' => 0x85,
        '†' => 0x86,
        '‡' => 0x87,
        'ˆ' => 0x88,
        '‰' => 0x89,
        'Š' => 0x8a,
        '‹' => 0x8b,
        'Œ' => 0x8c,
        'Ž' => 0x8e,
        '‘' => 0x91,
        '’' => 0x92,
        '“' => 0x93,
        '”' => 0x94,
        '•' => 0x95,
        '–' => 0x96,
        '—' => 0x97,
        '˜' => 0x98,
        '™' => 0x99,
        'š' => 0x9a,
        '›' => 0x9b,
        'œ' => 0x9c,
        'ž' => 0x9e,
        'Ÿ' => 0x9f,
        _ => REPLACEMENT,
    }
}

/// Helvetica advance widths for WinAnsi codes 32..=255, in 1/1000 em.
/// Unassigned codes get the bullet width.
#[rustfmt::skip]
const HELVETICA_WIDTHS: [u16; 224] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278, // 0x20
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556, // 0x30
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778, // 0x40
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556, // 0x50
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556, // 0x60
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584, 350, // 0x70
    556, 350, 222, 556, 333, 1000, 556, 556, 333, 1000, 667, 333, 1000, 350, 611, 350, // 0x80
    350, 222, 222, 333, 333, 350, 556, 1000, 333, 1000, 500, 333, 944, 350, 500, 667, // 0x90
    278, 333, 556, 556, 556, 556, 260, 556, 333, 737, 370, 556, 584, 333, 737, 333, // 0xa0
    400, 584, 333, 333, 333, 556, 537, 278, 333, 333, 365, 556, 834, 834, 834, 611, // 0xb0
    667, 667, 667, 667, 667, 667, 1000, 722, 667, 667, 667, 667, 278, 278, 278, 278, // 0xc0
    722, 722, 778, 778, 778, 778, 778, 584, 778, 722, 722, 722, 722, 667, 667, 611, // 0xd0
    556, 556, 556, 556, 556, 556, 889, 500, 556, 556, 556, 556, 278, 278, 278, 278, // 0xe0
    556, 556, 556, 556, 556, 556, 556, 584, 611, 556, 556, 556, 556, 500, 556, 500, // 0xf0
];

/// Width of one WinAnsi byte in Helvetica, in 1/1000 em.
fn helvetica_width(b: u8) -> u32 {
    match b {
        32.. => u32::from(HELVETICA_WIDTHS[usize::from(b - 32)]),
        _ => 0,
    }
}

/// The glyph for `c`, or `.notdef` if the font doesn't have one.
fn glyph_id(face: &Face<'_>, c: char) -> GlyphId {
    face.glyph_index(c).unwrap_or(GlyphId(0))
}

/// Advance width of `gid`, in 1/1000 em.
fn glyph_width(face: &Face<'_>, gid: GlyphId) -> u32 {
    let advance = u32::from(face.glyph_hor_advance(gid).unwrap_or(0));
    advance * 1000 / u32::from(face.units_per_em().max(1))
}

/// Greedy word wrap. Words wider than a whole line are split.
fn wrap_text(text: &str, max_width: f32, font_size: f32, typeface: &Typeface<'_>) -> Vec<String> {
    let mut lines = vec![];
    if text.is_empty() {
        return lines;
    }
    let space = typeface.text_width(" ", font_size);
    for paragraph in text.split('\n') {
        let mut line = String::new();
        let mut line_width = 0.0;
        for word in paragraph.split(' ').filter(|w| !w.is_empty()) {
            let word_width = typeface.text_width(word, font_size);
            let needed = if line.is_empty() { word_width } else { line_width + space + word_width };
            if needed <= max_width {
                if !line.is_empty() {
                    line.push(' ');
                }
                line.push_str(word);
                line_width = needed;
                continue;
            }
            if !line.is_empty() {
                lines.push(std::mem::take(&mut line));
            }
            line_width = 0.0;
            for c in word.chars() {
                let w = typeface.char_width(c) as f32 * font_size / 1000.0;
                if line_width + w > max_width && !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                    line_width = 0.0;
                }
                line.push(c);
                line_width += w;
            }
        }
        lines.push(line);
    }
    lines
}
