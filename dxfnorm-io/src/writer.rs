//! AC1015（R2000）文本 DXF 写出。
//!
//! 表、块记录、布局与字典的句柄在写出前统一分配，实体句柄边写边分配；
//! 正文先写入内存，最后在 HEADER 中补上 `$HANDSEED`。

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt::Display;
use std::io::Write;
use std::path::Path;

use dxfnorm_core::document::{
    Attribute, BlockDefinition, Document, Entity, EntityAttributes, EntityId, Layer, LineType,
    PolylineVertex, RasterImageDefinition, Space, TextStyle,
};
use dxfnorm_core::geometry::{Point2, Vector2};

use crate::reader::{ACTIVE_PAPER_BLOCK, REVCLOUD_APPID};

/// 组码 1/3 单行文本的最大字节数。
const TEXT_CHUNK: usize = 250;
const MODEL_BLOCK: &str = "*Model_Space";
const MODEL_LAYOUT: &str = "Model";
const DEFAULT_LAYOUT: &str = "Layout1";
/// 未命名的文档根对象。
const ROOT_OWNER: &str = "0";

/// AC1015 按代码页保存文本，非 ASCII 字符写成 `\U+XXXX`（UTF-16 码元）。
fn escape_unicode(value: &str) -> Cow<'_, str> {
    if value.is_ascii() {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() * 2);
    for ch in value.chars() {
        push_escaped(&mut escaped, ch);
    }
    Cow::Owned(escaped)
}

fn push_escaped(out: &mut String, ch: char) {
    if ch.is_ascii() {
        out.push(ch);
        return;
    }
    let mut units = [0u16; 2];
    for unit in ch.encode_utf16(&mut units) {
        out.push_str(&format!("\\U+{unit:04X}"));
    }
}

fn pair(out: &mut impl Write, code: i32, value: impl Display) -> std::io::Result<()> {
    let value = value.to_string();
    writeln!(out, "{code}")?;
    writeln!(out, "{}", escape_unicode(&value))
}

fn point(out: &mut impl Write, code: i32, at: Point2) -> std::io::Result<()> {
    pair(out, code, at.x())?;
    pair(out, code + 10, at.y())
}

fn vector(out: &mut impl Write, code: i32, v: Vector2) -> std::io::Result<()> {
    pair(out, code, v.x())?;
    pair(out, code + 10, v.y())
}

fn is_reserved_block(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.starts_with("*MODEL_SPACE") || upper.starts_with("*PAPER_SPACE")
}

/// 十六进制句柄分配器，跳过文档中图像定义已占用的句柄（IMAGE 的组码 340 引用它们）。
struct Handles {
    next: u64,
    reserved: HashSet<String>,
}

impl Handles {
    fn new(document: &Document) -> Self {
        Self {
            next: 1,
            reserved: document
                .image_definitions()
                .map(|definition| definition.handle.to_ascii_uppercase())
                .collect(),
        }
    }

    fn allocate(&mut self) -> String {
        loop {
            let handle = format!("{:X}", self.next);
            self.next += 1;
            if !self.reserved.contains(&handle) {
                return handle;
            }
        }
    }

    /// 大于任何已用句柄的下一个值。
    fn seed(&self) -> String {
        let reserved_max = self
            .reserved
            .iter()
            .filter_map(|handle| u64::from_str_radix(handle, 16).ok())
            .max()
            .map_or(0, |max| max + 1);
        format!("{:X}", self.next.max(reserved_max))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    VPort,
    LType,
    Layer,
    Style,
    View,
    Ucs,
    AppId,
    DimStyle,
    BlockRecord,
}

impl Table {
    const ORDER: [Table; 9] = [
        Table::VPort,
        Table::LType,
        Table::Layer,
        Table::Style,
        Table::View,
        Table::Ucs,
        Table::AppId,
        Table::DimStyle,
        Table::BlockRecord,
    ];

    fn name(self) -> &'static str {
        match self {
            Table::VPort => "VPORT",
            Table::LType => "LTYPE",
            Table::Layer => "LAYER",
            Table::Style => "STYLE",
            Table::View => "VIEW",
            Table::Ucs => "UCS",
            Table::AppId => "APPID",
            Table::DimStyle => "DIMSTYLE",
            Table::BlockRecord => "BLOCK_RECORD",
        }
    }
}

enum SlotKind<'a> {
    Model,
    /// 图纸空间块；`sheet` 为空时是没有图纸的文档所需的默认布局。
    Paper {
        sheet: Option<&'a str>,
        active: bool,
    },
    Definition(&'a BlockDefinition),
}

/// BLOCK_RECORD 与 BLOCK/ENDBLK 的一组句柄。
struct BlockSlot<'a> {
    name: String,
    record: String,
    begin: String,
    end: String,
    /// 模型空间与图纸空间块对应的 LAYOUT 对象。
    layout: Option<String>,
    kind: SlotKind<'a>,
}

impl BlockSlot<'_> {
    fn is_paper(&self) -> bool {
        matches!(self.kind, SlotKind::Paper { .. })
    }

    fn layout_name(&self) -> &str {
        match self.kind {
            SlotKind::Model => MODEL_LAYOUT,
            SlotKind::Paper { sheet, .. } => sheet.unwrap_or(DEFAULT_LAYOUT),
            SlotKind::Definition(block) => &block.name,
        }
    }
}

struct DxfWriter<'a> {
    document: &'a Document,
    handles: Handles,
    tables: Vec<(Table, String)>,
    slots: Vec<BlockSlot<'a>>,
    root_dictionary: String,
    group_dictionary: String,
    layout_dictionary: String,
    image_dictionary: String,
}

/// 以 AC1015 文本格式输出整份文档。
///
/// 第一张图纸写成 `*Paper_Space` 活动布局，其实体放在 ENTITIES 段并带组码 67；
/// 其余图纸写成 `*Paper_SpaceN` 块，实体保存在块内。每个布局块都有同名
/// LAYOUT 对象，块描述（组码 4）同样记录图纸名。
pub(crate) fn write_document(document: &Document, out: &mut impl Write) -> std::io::Result<()> {
    let mut writer = DxfWriter::new(document);
    let mut body = Vec::new();
    writer.write_classes(&mut body)?;
    writer.write_tables(&mut body)?;
    writer.write_blocks(&mut body)?;
    writer.write_entities(&mut body)?;
    writer.write_objects(&mut body)?;
    write_header(out, &writer.handles.seed())?;
    out.write_all(&body)?;
    pair(out, 0, "EOF")?;
    out.flush()
}

fn write_header(out: &mut impl Write, handle_seed: &str) -> std::io::Result<()> {
    pair(out, 0, "SECTION")?;
    pair(out, 2, "HEADER")?;
    pair(out, 9, "$ACADVER")?;
    pair(out, 1, "AC1015")?;
    pair(out, 9, "$DWGCODEPAGE")?;
    pair(out, 3, "ANSI_1252")?;
    pair(out, 9, "$HANDSEED")?;
    pair(out, 5, handle_seed)?;
    // 毫米
    pair(out, 9, "$INSUNITS")?;
    pair(out, 70, 4)?;
    pair(out, 9, "$MEASUREMENT")?;
    pair(out, 70, 1)?;
    pair(out, 0, "ENDSEC")
}

impl<'a> DxfWriter<'a> {
    fn new(document: &'a Document) -> Self {
        let mut handles = Handles::new(document);
        let tables = Table::ORDER
            .iter()
            .map(|table| (*table, handles.allocate()))
            .collect();
        let root_dictionary = handles.allocate();
        let group_dictionary = handles.allocate();
        let layout_dictionary = handles.allocate();
        let image_dictionary = handles.allocate();

        let mut kinds: Vec<(String, SlotKind<'a>)> = vec![(MODEL_BLOCK.to_string(), SlotKind::Model)];
        let sheets: Vec<&'a str> = document.sheet_names().collect();
        if sheets.is_empty() {
            kinds.push((
                ACTIVE_PAPER_BLOCK.to_string(),
                SlotKind::Paper {
                    sheet: None,
                    active: true,
                },
            ));
        }
        for (index, sheet) in sheets.into_iter().enumerate() {
            let name = if index == 0 {
                ACTIVE_PAPER_BLOCK.to_string()
            } else {
                format!("{ACTIVE_PAPER_BLOCK}{}", index - 1)
            };
            kinds.push((
                name,
                SlotKind::Paper {
                    sheet: Some(sheet),
                    active: index == 0,
                },
            ));
        }
        for block in document.blocks().filter(|block| !is_reserved_block(&block.name)) {
            kinds.push((block.name.clone(), SlotKind::Definition(block)));
        }

        let slots = kinds
            .into_iter()
            .map(|(name, kind)| {
                let layout = (!matches!(kind, SlotKind::Definition(_))).then(|| handles.allocate());
                BlockSlot {
                    name,
                    record: handles.allocate(),
                    begin: handles.allocate(),
                    end: handles.allocate(),
                    layout,
                    kind,
                }
            })
            .collect();

        Self {
            document,
            handles,
            tables,
            slots,
            root_dictionary,
            group_dictionary,
            layout_dictionary,
            image_dictionary,
        }
    }

    fn table_handle(&self, table: Table) -> &str {
        self.tables
            .iter()
            .find_map(|(candidate, handle)| (*candidate == table).then_some(handle.as_str()))
            .unwrap_or(ROOT_OWNER)
    }

    fn slot(&self, predicate: impl Fn(&BlockSlot<'a>) -> bool) -> Option<&BlockSlot<'a>> {
        self.slots.iter().find(|slot| predicate(slot))
    }

    // ---- CLASSES ----

    fn write_classes(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        pair(out, 0, "SECTION")?;
        pair(out, 2, "CLASSES")?;
        for (dxf_name, class_name, proxy_flags, is_entity) in [
            ("IMAGEDEF", "AcDbRasterImageDef", 0, false),
            ("IMAGE", "AcDbRasterImage", 127, true),
        ] {
            pair(out, 0, "CLASS")?;
            pair(out, 1, dxf_name)?;
            pair(out, 2, class_name)?;
            pair(out, 3, "ISM")?;
            pair(out, 90, proxy_flags)?;
            pair(out, 280, 0)?;
            pair(out, 281, u8::from(is_entity))?;
        }
        pair(out, 0, "ENDSEC")
    }

    // ---- TABLES ----

    fn write_tables(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        pair(out, 0, "SECTION")?;
        pair(out, 2, "TABLES")?;
        for table in Table::ORDER {
            self.write_table(out, table)?;
        }
        pair(out, 0, "ENDSEC")
    }

    fn write_table(&mut self, out: &mut impl Write, table: Table) -> std::io::Result<()> {
        let owner = self.table_handle(table).to_string();
        let document = self.document;
        let count = match table {
            Table::VPort | Table::DimStyle => 1,
            Table::LType => document.linetypes().count(),
            Table::Layer => document.layers().count(),
            Table::Style => document.text_styles().count(),
            Table::View | Table::Ucs => 0,
            Table::AppId => 2,
            Table::BlockRecord => self.slots.len(),
        };
        pair(out, 0, "TABLE")?;
        pair(out, 2, table.name())?;
        pair(out, 5, &owner)?;
        pair(out, 330, ROOT_OWNER)?;
        pair(out, 100, "AcDbSymbolTable")?;
        pair(out, 70, count)?;
        if table == Table::DimStyle {
            pair(out, 100, "AcDbDimStyleTable")?;
        }

        match table {
            Table::VPort => self.write_active_vport(out, &owner)?,
            Table::LType => {
                for linetype in document.linetypes() {
                    self.write_linetype(out, &owner, linetype)?;
                }
            }
            Table::Layer => {
                for layer in document.layers() {
                    self.write_layer(out, &owner, layer)?;
                }
            }
            Table::Style => {
                for style in document.text_styles() {
                    self.write_style(out, &owner, style)?;
                }
            }
            Table::View | Table::Ucs => {}
            Table::AppId => {
                for name in ["ACAD", REVCLOUD_APPID] {
                    self.begin_record(out, "APPID", &owner, "AcDbRegAppTableRecord")?;
                    pair(out, 2, name)?;
                    pair(out, 70, 0)?;
                }
            }
            Table::DimStyle => {
                pair(out, 0, "DIMSTYLE")?;
                pair(out, 105, self.handles.allocate())?;
                pair(out, 330, &owner)?;
                pair(out, 100, "AcDbSymbolTableRecord")?;
                pair(out, 100, "AcDbDimStyleTableRecord")?;
                pair(out, 2, "Standard")?;
                pair(out, 70, 0)?;
            }
            Table::BlockRecord => {
                for slot in &self.slots {
                    pair(out, 0, "BLOCK_RECORD")?;
                    pair(out, 5, &slot.record)?;
                    pair(out, 330, &owner)?;
                    pair(out, 100, "AcDbSymbolTableRecord")?;
                    pair(out, 100, "AcDbBlockTableRecord")?;
                    pair(out, 2, &slot.name)?;
                    if let Some(layout) = &slot.layout {
                        pair(out, 340, layout)?;
                    }
                }
            }
        }
        pair(out, 0, "ENDTAB")
    }

    fn begin_record(
        &mut self,
        out: &mut impl Write,
        kind: &str,
        owner: &str,
        subclass: &str,
    ) -> std::io::Result<()> {
        pair(out, 0, kind)?;
        pair(out, 5, self.handles.allocate())?;
        pair(out, 330, owner)?;
        pair(out, 100, "AcDbSymbolTableRecord")?;
        pair(out, 100, subclass)
    }

    fn write_active_vport(&mut self, out: &mut impl Write, owner: &str) -> std::io::Result<()> {
        self.begin_record(out, "VPORT", owner, "AcDbViewportTableRecord")?;
        pair(out, 2, "*Active")?;
        pair(out, 70, 0)?;
        point(out, 10, Point2::new(0.0, 0.0))?;
        point(out, 11, Point2::new(1.0, 1.0))?;
        point(out, 12, Point2::new(0.0, 0.0))?;
        pair(out, 40, 100.0)?;
        pair(out, 41, 1.5)
    }

    fn write_linetype(
        &mut self,
        out: &mut impl Write,
        owner: &str,
        linetype: &LineType,
    ) -> std::io::Result<()> {
        let pattern = linetype.pattern.as_deref().unwrap_or(&[]);
        self.begin_record(out, "LTYPE", owner, "AcDbLinetypeTableRecord")?;
        pair(out, 2, &linetype.name)?;
        pair(out, 70, 0)?;
        pair(out, 3, linetype.description.as_deref().unwrap_or(""))?;
        pair(out, 72, 65)?;
        pair(out, 73, pattern.len())?;
        pair(out, 40, pattern.iter().map(|dash| dash.abs()).sum::<f64>())?;
        for dash in pattern {
            pair(out, 49, dash)?;
            pair(out, 74, 0)?;
        }
        Ok(())
    }

    fn write_layer(&mut self, out: &mut impl Write, owner: &str, layer: &Layer) -> std::io::Result<()> {
        // 负颜色号表示图层关闭
        let color = if layer.is_visible {
            layer.color
        } else {
            -layer.color
        };
        self.begin_record(out, "LAYER", owner, "AcDbLayerTableRecord")?;
        pair(out, 2, &layer.name)?;
        pair(out, 70, 0)?;
        pair(out, 62, color)?;
        pair(out, 6, &layer.linetype)?;
        pair(out, 370, layer.lineweight)
    }

    fn write_style(&mut self, out: &mut impl Write, owner: &str, style: &TextStyle) -> std::io::Result<()> {
        self.begin_record(out, "STYLE", owner, "AcDbTextStyleTableRecord")?;
        pair(out, 2, &style.name)?;
        pair(out, 70, 0)?;
        pair(out, 40, style.height)?;
        pair(out, 41, 1.0)?;
        pair(out, 50, 0.0)?;
        pair(out, 71, 0)?;
        pair(out, 42, if style.height > 0.0 { style.height } else { 2.5 })?;
        pair(out, 3, style.font.as_deref().unwrap_or(""))?;
        pair(out, 4, "")
    }

    // ---- BLOCKS ----

    fn write_blocks(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        pair(out, 0, "SECTION")?;
        pair(out, 2, "BLOCKS")?;
        for index in 0..self.slots.len() {
            self.write_block(out, index)?;
        }
        pair(out, 0, "ENDSEC")
    }

    fn write_block(&mut self, out: &mut impl Write, index: usize) -> std::io::Result<()> {
        let document = self.document;
        let slot = &self.slots[index];
        let paper_space = slot.is_paper();
        let record = slot.record.clone();
        let end = slot.end.clone();
        let (base, description, entities): (Point2, Option<&str>, Vec<&Entity>) = match slot.kind {
            SlotKind::Model => (Point2::new(0.0, 0.0), None, Vec::new()),
            SlotKind::Paper { sheet, active } => {
                // 活动布局的实体写在 ENTITIES 段
                let entities = match sheet {
                    Some(sheet) if !active => sheet_entities(document, sheet)
                        .iter()
                        .map(|(_, entity)| entity)
                        .collect(),
                    _ => Vec::new(),
                };
                (Point2::new(0.0, 0.0), sheet, entities)
            }
            SlotKind::Definition(block) => (block.base_point, None, block.entities.iter().collect()),
        };

        pair(out, 0, "BLOCK")?;
        pair(out, 5, &slot.begin)?;
        pair(out, 330, &record)?;
        pair(out, 100, "AcDbEntity")?;
        if paper_space {
            pair(out, 67, 1)?;
        }
        pair(out, 8, "0")?;
        pair(out, 100, "AcDbBlockBegin")?;
        pair(out, 2, &slot.name)?;
        pair(out, 70, 0)?;
        point(out, 10, base)?;
        pair(out, 3, &slot.name)?;
        pair(out, 1, "")?;
        if let Some(description) = description {
            pair(out, 4, description)?;
        }

        for entity in entities {
            self.write_entity(out, entity, &record, paper_space)?;
        }

        pair(out, 0, "ENDBLK")?;
        pair(out, 5, &end)?;
        pair(out, 330, &record)?;
        pair(out, 100, "AcDbEntity")?;
        if paper_space {
            pair(out, 67, 1)?;
        }
        pair(out, 8, "0")?;
        pair(out, 100, "AcDbBlockEnd")
    }

    // ---- ENTITIES ----

    fn write_entities(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        let document = self.document;
        pair(out, 0, "SECTION")?;
        pair(out, 2, "ENTITIES")?;
        if let Some(model) = self.slot(|slot| matches!(slot.kind, SlotKind::Model)) {
            let owner = model.record.clone();
            for (_, entity) in document.entities() {
                self.write_entity(out, entity, &owner, false)?;
            }
        }
        let active = self
            .slot(|slot| matches!(slot.kind, SlotKind::Paper { active: true, .. }))
            .and_then(|slot| match slot.kind {
                SlotKind::Paper { sheet, .. } => sheet.map(|sheet| (sheet, slot.record.clone())),
                _ => None,
            });
        if let Some((sheet, owner)) = active {
            for (_, entity) in sheet_entities(document, sheet) {
                self.write_entity(out, entity, &owner, true)?;
            }
        }
        pair(out, 0, "ENDSEC")
    }

    /// 实体公共段，返回分配给该实体的句柄。
    fn write_common(
        &mut self,
        out: &mut impl Write,
        kind: &str,
        attrs: &EntityAttributes,
        owner: &str,
        paper_space: bool,
    ) -> std::io::Result<String> {
        let handle = self.handles.allocate();
        pair(out, 0, kind)?;
        pair(out, 5, &handle)?;
        pair(out, 330, owner)?;
        pair(out, 100, "AcDbEntity")?;
        if paper_space {
            pair(out, 67, 1)?;
        }
        pair(out, 8, &attrs.layer)?;
        pair(out, 6, &attrs.linetype)?;
        pair(out, 62, attrs.color)?;
        pair(out, 370, attrs.lineweight)?;
        Ok(handle)
    }

    fn write_entity(
        &mut self,
        out: &mut impl Write,
        entity: &Entity,
        owner: &str,
        paper_space: bool,
    ) -> std::io::Result<()> {
        match entity {
            Entity::Line(line) => {
                self.write_common(out, "LINE", &line.attrs, owner, paper_space)?;
                pair(out, 100, "AcDbLine")?;
                point(out, 10, line.start)?;
                point(out, 11, line.end)
            }
            Entity::Circle(circle) => {
                self.write_common(out, "CIRCLE", &circle.attrs, owner, paper_space)?;
                pair(out, 100, "AcDbCircle")?;
                point(out, 10, circle.center)?;
                pair(out, 40, circle.radius)
            }
            Entity::Arc(arc) => {
                self.write_common(out, "ARC", &arc.attrs, owner, paper_space)?;
                pair(out, 100, "AcDbCircle")?;
                point(out, 10, arc.center)?;
                pair(out, 40, arc.radius)?;
                pair(out, 100, "AcDbArc")?;
                pair(out, 50, arc.start_angle.to_degrees())?;
                pair(out, 51, arc.end_angle.to_degrees())
            }
            Entity::Ellipse(ellipse) => {
                self.write_common(out, "ELLIPSE", &ellipse.attrs, owner, paper_space)?;
                pair(out, 100, "AcDbEllipse")?;
                point(out, 10, ellipse.center)?;
                vector(out, 11, ellipse.major_axis)?;
                pair(out, 40, ellipse.ratio)?;
                pair(out, 41, ellipse.start_parameter)?;
                pair(out, 42, ellipse.end_parameter)
            }
            Entity::Polyline(polyline) => {
                self.write_common(out, "LWPOLYLINE", &polyline.attrs, owner, paper_space)?;
                pair(out, 100, "AcDbPolyline")?;
                write_vertices(out, &polyline.vertices, polyline.is_closed)
            }
            Entity::RevisionCloud(cloud) => {
                self.write_common(out, "LWPOLYLINE", &cloud.attrs, owner, paper_space)?;
                pair(out, 100, "AcDbPolyline")?;
                pair(out, 90, cloud.vertices.len())?;
                pair(out, 70, 1)?;
                for vertex in &cloud.vertices {
                    point(out, 10, vertex.position)?;
                    pair(out, 42, vertex.bulge)?;
                }
                pair(out, 1001, REVCLOUD_APPID)?;
                pair(out, 1070, 0)?;
                pair(out, 1040, cloud.segment_length)
            }
            Entity::Text(text) => {
                self.write_common(out, "TEXT", &text.attrs, owner, paper_space)?;
                pair(out, 100, "AcDbText")?;
                point(out, 10, text.insert)?;
                pair(out, 40, text.height)?;
                pair(out, 1, single_line(&text.content))?;
                pair(out, 50, text.rotation.to_degrees())?;
                if let Some(style) = &text.style {
                    pair(out, 7, style)?;
                }
                pair(out, 100, "AcDbText")
            }
            Entity::MText(mtext) => {
                self.write_common(out, "MTEXT", &mtext.attrs, owner, paper_space)?;
                pair(out, 100, "AcDbMText")?;
                point(out, 10, mtext.insert)?;
                pair(out, 40, mtext.height)?;
                if let Some(width) = mtext.reference_width {
                    pair(out, 41, width)?;
                }
                pair(out, 71, mtext.attachment_point)?;
                write_mtext_content(out, &mtext.content)?;
                if let Some(style) = &mtext.style {
                    pair(out, 7, style)?;
                }
                vector(out, 11, mtext.direction)
            }
            Entity::BlockReference(reference) => {
                let handle =
                    self.write_common(out, "INSERT", &reference.attrs, owner, paper_space)?;
                pair(out, 100, "AcDbBlockReference")?;
                if !reference.attributes.is_empty() {
                    pair(out, 66, 1)?;
                }
                pair(out, 2, &reference.name)?;
                point(out, 10, reference.insert)?;
                pair(out, 41, reference.scale.x())?;
                pair(out, 42, reference.scale.y())?;
                pair(out, 50, reference.rotation.to_degrees())?;
                if reference.attributes.is_empty() {
                    return Ok(());
                }
                for attribute in &reference.attributes {
                    self.write_attribute(out, attribute, &handle, paper_space)?;
                }
                pair(out, 0, "SEQEND")?;
                pair(out, 5, self.handles.allocate())?;
                pair(out, 330, &handle)?;
                pair(out, 100, "AcDbEntity")?;
                if paper_space {
                    pair(out, 67, 1)?;
                }
                pair(out, 8, &reference.attrs.layer)
            }
            Entity::RasterImage(image) => {
                self.write_common(out, "IMAGE", &image.attrs, owner, paper_space)?;
                pair(out, 100, "AcDbRasterImage")?;
                pair(out, 90, 0)?;
                point(out, 10, image.insert)?;
                vector(out, 11, image.u_vector)?;
                vector(out, 12, image.v_vector)?;
                vector(out, 13, image.image_size)?;
                pair(out, 340, &image.image_def_handle)?;
                // 显示图像，显示未对齐图像
                pair(out, 70, 3)?;
                pair(out, 280, 0)?;
                pair(out, 281, 50)?;
                pair(out, 282, 50)?;
                pair(out, 283, 0)
            }
            Entity::Raw(raw) => {
                self.write_common(out, &raw.kind, &raw.attrs, owner, paper_space)?;
                for (code, value) in &raw.pairs {
                    pair(out, *code, value)?;
                }
                Ok(())
            }
        }
    }

    fn write_attribute(
        &mut self,
        out: &mut impl Write,
        attribute: &Attribute,
        owner: &str,
        paper_space: bool,
    ) -> std::io::Result<()> {
        self.write_common(out, "ATTRIB", &attribute.attrs, owner, paper_space)?;
        pair(out, 100, "AcDbText")?;
        point(out, 10, attribute.insert)?;
        pair(out, 40, attribute.height)?;
        pair(out, 1, encode_text(&attribute.text))?;
        pair(out, 50, attribute.rotation.to_degrees())?;
        if let Some(style) = &attribute.style {
            pair(out, 7, style)?;
        }
        pair(out, 100, "AcDbAttribute")?;
        pair(out, 2, &attribute.tag)?;
        pair(out, 70, 0)
    }

    // ---- OBJECTS ----

    fn write_objects(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        let document = self.document;
        let definitions: Vec<&RasterImageDefinition> = document.image_definitions().collect();
        pair(out, 0, "SECTION")?;
        pair(out, 2, "OBJECTS")?;

        let mut root_entries = vec![
            ("ACAD_GROUP", self.group_dictionary.as_str()),
            ("ACAD_LAYOUT", self.layout_dictionary.as_str()),
        ];
        if !definitions.is_empty() {
            root_entries.push(("ACAD_IMAGE_DICT", self.image_dictionary.as_str()));
        }
        write_dictionary(out, &self.root_dictionary, ROOT_OWNER, &root_entries)?;
        write_dictionary(out, &self.group_dictionary, &self.root_dictionary, &[])?;

        let layouts: Vec<(&str, &str)> = self
            .slots
            .iter()
            .filter_map(|slot| {
                slot.layout
                    .as_deref()
                    .map(|layout| (slot.layout_name(), layout))
            })
            .collect();
        write_dictionary(out, &self.layout_dictionary, &self.root_dictionary, &layouts)?;

        for (tab_order, slot) in self.slots.iter().filter(|slot| slot.layout.is_some()).enumerate() {
            write_layout(out, slot, tab_order, &self.layout_dictionary)?;
        }

        if !definitions.is_empty() {
            let names = image_names(&definitions);
            let entries: Vec<(&str, &str)> = names
                .iter()
                .zip(&definitions)
                .map(|(name, definition)| (name.as_str(), definition.handle.as_str()))
                .collect();
            write_dictionary(out, &self.image_dictionary, &self.root_dictionary, &entries)?;
            for definition in definitions {
                write_image_def(out, definition, &self.image_dictionary)?;
            }
        }
        pair(out, 0, "ENDSEC")
    }
}

fn sheet_entities<'a>(document: &'a Document, sheet: &str) -> &'a [(EntityId, Entity)] {
    document
        .space_entities(&Space::Sheet(sheet.to_string()))
        .unwrap_or(&[])
}

fn write_dictionary(
    out: &mut impl Write,
    handle: &str,
    owner: &str,
    entries: &[(&str, &str)],
) -> std::io::Result<()> {
    pair(out, 0, "DICTIONARY")?;
    pair(out, 5, handle)?;
    pair(out, 330, owner)?;
    pair(out, 100, "AcDbDictionary")?;
    pair(out, 281, 1)?;
    for (key, value) in entries {
        pair(out, 3, key)?;
        pair(out, 350, value)?;
    }
    Ok(())
}

fn write_layout(
    out: &mut impl Write,
    slot: &BlockSlot<'_>,
    tab_order: usize,
    owner: &str,
) -> std::io::Result<()> {
    let Some(handle) = &slot.layout else {
        return Ok(());
    };
    pair(out, 0, "LAYOUT")?;
    pair(out, 5, handle)?;
    pair(out, 330, owner)?;
    pair(out, 100, "AcDbPlotSettings")?;
    pair(out, 1, "")?;
    pair(out, 2, "none_device")?;
    pair(out, 4, "")?;
    pair(out, 6, "")?;
    for code in [40, 41, 42, 43, 44, 45, 46, 47, 48, 49, 140, 141] {
        pair(out, code, 0.0)?;
    }
    pair(out, 142, 1.0)?;
    pair(out, 143, 1.0)?;
    pair(out, 70, 688)?;
    pair(out, 72, 0)?;
    pair(out, 73, 0)?;
    pair(out, 74, 5)?;
    pair(out, 100, "AcDbLayout")?;
    pair(out, 1, slot.layout_name())?;
    pair(out, 70, 1)?;
    pair(out, 71, tab_order)?;
    point(out, 10, Point2::new(0.0, 0.0))?;
    point(out, 11, Point2::new(420.0, 297.0))?;
    point(out, 12, Point2::new(0.0, 0.0))?;
    pair(out, 32, 0.0)?;
    point(out, 14, Point2::new(0.0, 0.0))?;
    pair(out, 34, 0.0)?;
    point(out, 15, Point2::new(0.0, 0.0))?;
    pair(out, 35, 0.0)?;
    pair(out, 146, 0.0)?;
    point(out, 13, Point2::new(0.0, 0.0))?;
    pair(out, 33, 0.0)?;
    point(out, 16, Point2::new(1.0, 0.0))?;
    pair(out, 36, 0.0)?;
    point(out, 17, Point2::new(0.0, 1.0))?;
    pair(out, 37, 0.0)?;
    pair(out, 76, 0)?;
    pair(out, 330, &slot.record)
}

/// 图像字典的键：文件名去掉扩展名，重名时追加序号。
fn image_names(definitions: &[&RasterImageDefinition]) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::new();
    definitions
        .iter()
        .enumerate()
        .map(|(index, definition)| {
            let stem = Path::new(&definition.file_path)
                .file_stem()
                .and_then(|stem| stem.to_str())
                .filter(|stem| !stem.is_empty())
                .unwrap_or("IMAGE");
            let mut name = stem.to_string();
            if !used.insert(name.to_ascii_uppercase()) {
                name = format!("{stem}_{}", index + 1);
                used.insert(name.to_ascii_uppercase());
            }
            name
        })
        .collect()
}

fn write_image_def(
    out: &mut impl Write,
    definition: &RasterImageDefinition,
    owner: &str,
) -> std::io::Result<()> {
    pair(out, 0, "IMAGEDEF")?;
    pair(out, 5, &definition.handle)?;
    pair(out, 330, owner)?;
    pair(out, 100, "AcDbRasterImageDef")?;
    pair(out, 90, 0)?;
    pair(out, 1, &definition.file_path)?;
    if let Some(size) = definition.image_size_pixels {
        vector(out, 10, size)?;
    }
    vector(out, 11, Vector2::new(1.0, 1.0))?;
    pair(out, 280, 1)?;
    pair(out, 281, 0)
}

fn write_vertices(
    out: &mut impl Write,
    vertices: &[PolylineVertex],
    is_closed: bool,
) -> std::io::Result<()> {
    pair(out, 90, vertices.len())?;
    pair(out, 70, if is_closed { 1 } else { 0 })?;
    for vertex in vertices {
        point(out, 10, vertex.position)?;
        if vertex.bulge != 0.0 {
            pair(out, 42, vertex.bulge)?;
        }
    }
    Ok(())
}

/// TEXT 只允许一个组码 1，换行改为空格。
fn single_line(content: &str) -> String {
    content
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .collect::<Vec<_>>()
        .join(" ")
}

/// 转义多行文字中的反斜杠与换行。
fn encode_text(content: &str) -> String {
    let mut encoded = String::with_capacity(content.len());
    for ch in content.chars() {
        match ch {
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\P"),
            '\r' => {}
            other => encoded.push(other),
        }
    }
    encoded
}

/// 按转义后的字节数切分 MTEXT 内容，不拆开任何转义序列。
fn write_mtext_content(out: &mut impl Write, content: &str) -> std::io::Result<()> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut token = String::new();
    for ch in encode_text(content).chars() {
        token.clear();
        push_escaped(&mut token, ch);
        if current.len() + token.len() > TEXT_CHUNK {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(&token);
    }
    for chunk in chunks {
        pair(out, 3, chunk)?;
    }
    pair(out, 1, current)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use dxfnorm_core::document::Text;

    use super::*;

    fn render(document: &Document) -> String {
        let mut buffer = Vec::new();
        write_document(document, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    fn pairs(text: &str) -> Vec<(i32, String)> {
        let lines: Vec<&str> = text.lines().collect();
        lines
            .chunks(2)
            .map(|chunk| (chunk[0].trim().parse().unwrap(), chunk[1].to_string()))
            .collect()
    }

    /// 从 `0/kind` 开始到下一个组码 0 为止的组码对。
    fn records<'a>(pairs: &'a [(i32, String)], kind: &str) -> Vec<&'a [(i32, String)]> {
        let starts: Vec<usize> = pairs
            .iter()
            .enumerate()
            .filter(|(_, (code, value))| *code == 0 && value == kind)
            .map(|(index, _)| index)
            .collect();
        starts
            .into_iter()
            .map(|start| {
                let end = pairs[start + 1..]
                    .iter()
                    .position(|(code, _)| *code == 0)
                    .map_or(pairs.len(), |offset| start + 1 + offset);
                &pairs[start..end]
            })
            .collect()
    }

    fn value(record: &[(i32, String)], code: i32) -> Option<&str> {
        record
            .iter()
            .find(|(candidate, _)| *candidate == code)
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn long_mtext_is_split_into_chunks() {
        let mut buffer = Vec::new();
        let content = "x".repeat(TEXT_CHUNK + 10);
        write_mtext_content(&mut buffer, &content).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "3");
        assert_eq!(lines[1].len(), TEXT_CHUNK);
        assert_eq!(lines[2], "1");
        assert_eq!(lines[3].len(), 10);
    }

    #[test]
    fn chunks_never_split_unicode_escapes() {
        let mut buffer = Vec::new();
        write_mtext_content(&mut buffer, &"长".repeat(40)).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.is_ascii(), "非 ASCII 字符全部转义");
        for line in text.lines().skip(1).step_by(2) {
            assert!(line.len() <= TEXT_CHUNK);
            assert_eq!(line.len() % 7, 0, "每段都由完整的 \\U+XXXX 组成");
        }
    }

    #[test]
    fn text_escapes_backslash_and_newline() {
        assert_eq!(encode_text("a\\b\nc"), "a\\\\b\\Pc");
        assert_eq!(escape_unicode("图A"), "\\U+56FEA");
        assert_eq!(escape_unicode("plain"), "plain");
    }

    #[test]
    fn empty_document_has_all_sections() {
        let text = render(&Document::new());
        for section in ["HEADER", "CLASSES", "TABLES", "BLOCKS", "ENTITIES", "OBJECTS"] {
            assert!(text.contains(&format!("2\n{section}\n")), "missing {section}");
        }
        for table in ["VPORT", "LTYPE", "LAYER", "STYLE", "VIEW", "UCS", "APPID", "DIMSTYLE", "BLOCK_RECORD"] {
            assert!(text.contains(&format!("0\nTABLE\n2\n{table}\n")), "missing table {table}");
        }
        assert!(text.contains("*Model_Space"));
        assert!(text.contains("*Paper_Space"));
        assert!(text.ends_with("0\nEOF\n"));
    }

    #[test]
    fn multi_line_text_is_written_as_one_group_one() {
        let mut doc = Document::new();
        doc.add_entity(Entity::Text(Text {
            insert: Point2::new(0.0, 0.0),
            content: "first\nsecond".to_string(),
            height: 2.5,
            rotation: 0.0,
            style: None,
            attrs: EntityAttributes::on_layer("NOTES"),
        }));
        let all = pairs(&render(&doc));
        let texts = records(&all, "TEXT");
        assert_eq!(texts.len(), 1);
        let contents: Vec<&str> = texts[0]
            .iter()
            .filter(|(code, _)| *code == 1)
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(contents, vec!["first second"]);
    }

    #[test]
    fn every_handle_is_unique_and_below_seed() {
        let mut doc = Document::new();
        doc.add_image_definition(RasterImageDefinition {
            handle: "3".to_string(),
            file_path: "stamp.png".to_string(),
            image_size_pixels: None,
        });
        doc.add_line(Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), "A");
        doc.add_sheet("FL1").unwrap();
        doc.add_sheet("FL2").unwrap();
        doc.add_entity_to(
            &Space::Sheet("FL2".to_string()),
            Entity::Text(Text {
                insert: Point2::new(0.0, 0.0),
                content: "T".to_string(),
                height: 1.0,
                rotation: 0.0,
                style: None,
                attrs: EntityAttributes::on_layer("B"),
            }),
        )
        .unwrap();
        let all = pairs(&render(&doc));
        let seed_index = all
            .iter()
            .position(|(code, value)| *code == 9 && value == "$HANDSEED")
            .unwrap();
        let seed = u64::from_str_radix(&all[seed_index + 1].1, 16).unwrap();

        let mut seen = HashSet::new();
        for (code, value) in &all[seed_index + 2..] {
            if *code == 5 || *code == 105 {
                assert!(seen.insert(value.clone()), "句柄 {value} 重复");
            }
        }
        // 文档自身的图像定义句柄原样保留
        assert!(seen.contains("3"));
        for handle in seen {
            assert!(u64::from_str_radix(&handle, 16).unwrap() < seed);
        }
    }

    #[test]
    fn entities_carry_handle_owner_and_subclass() {
        let mut doc = Document::new();
        doc.add_line(Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), "A");
        let all = pairs(&render(&doc));
        let model_record = records(&all, "BLOCK_RECORD")
            .into_iter()
            .find(|record| value(record, 2) == Some("*Model_Space"))
            .and_then(|record| value(record, 5))
            .unwrap()
            .to_string();

        let line = records(&all, "LINE")[0];
        assert!(value(line, 5).is_some());
        assert_eq!(value(line, 330), Some(model_record.as_str()));
        let markers: Vec<&str> = line
            .iter()
            .filter(|(code, _)| *code == 100)
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(markers, vec!["AcDbEntity", "AcDbLine"]);
    }

    #[test]
    fn layouts_are_named_after_sheets() {
        let mut doc = Document::new();
        for sheet in ["FL1", "FL2", "FL3"] {
            doc.add_sheet(sheet).unwrap();
        }
        let all = pairs(&render(&doc));

        let records_by_handle: HashMap<String, String> = records(&all, "BLOCK_RECORD")
            .into_iter()
            .map(|record| {
                (
                    value(record, 5).unwrap().to_string(),
                    value(record, 2).unwrap().to_string(),
                )
            })
            .collect();
        let mut layouts: Vec<(String, String)> = records(&all, "LAYOUT")
            .into_iter()
            .map(|record| {
                let layout_part = record
                    .iter()
                    .position(|(code, value)| *code == 100 && value == "AcDbLayout")
                    .unwrap();
                let tail = &record[layout_part..];
                let name = value(tail, 1).unwrap().to_string();
                let block = records_by_handle[value(tail, 330).unwrap()].clone();
                (name, block)
            })
            .collect();
        layouts.sort();
        assert_eq!(
            layouts,
            vec![
                ("FL1".to_string(), "*Paper_Space".to_string()),
                ("FL2".to_string(), "*Paper_Space0".to_string()),
                ("FL3".to_string(), "*Paper_Space1".to_string()),
                ("Model".to_string(), "*Model_Space".to_string()),
            ]
        );

        let dictionary = records(&all, "DICTIONARY");
        assert!(
            dictionary[0]
                .iter()
                .any(|(code, value)| *code == 3 && value == "ACAD_LAYOUT"),
            "根字典登记布局字典"
        );
    }
}
