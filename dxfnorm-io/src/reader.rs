use std::collections::HashMap;
use std::convert::TryFrom;

use dxfnorm_core::document::{
    Arc, Attribute, BlockDefinition, BlockReference, Circle, Document, Ellipse, Entity,
    EntityAttributes, LAYER_ZERO, Layer, Line, LineType, MText, Polyline, PolylineVertex,
    RasterImage, RasterImageDefinition, RawEntity, RevisionCloud, Space, Text, TextStyle,
};
use dxfnorm_core::geometry::{Point2, Vector2};
use tracing::warn;

use crate::IoError;

/// 修订云线在 LWPOLYLINE 上附带的扩展数据应用名。
pub(crate) const REVCLOUD_APPID: &str = "RevcloudProps";
/// 图纸空间中未命名的默认图纸。
const DEFAULT_SHEET: &str = "Layout1";
/// 活动布局对应的块名。
pub(crate) const ACTIVE_PAPER_BLOCK: &str = "*Paper_Space";
const BINARY_SENTINEL: &str = "AutoCAD Binary DXF";

/// 按几何模型解析的实体类型，其余类型按原始组码保存。
const MODELED_KINDS: [&str; 9] = [
    "LINE",
    "CIRCLE",
    "ARC",
    "ELLIPSE",
    "LWPOLYLINE",
    "TEXT",
    "MTEXT",
    "INSERT",
    "IMAGE",
];

#[derive(Debug)]
pub(crate) enum DxfError {
    Unsupported { feature: String },
    Invalid { message: String },
}

impl DxfError {
    fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

impl From<DxfError> for IoError {
    fn from(err: DxfError) -> Self {
        match err {
            DxfError::Unsupported { feature } => IoError::UnsupportedFeature(feature),
            DxfError::Invalid { message } => IoError::InvalidDocument(message),
        }
    }
}

/// 实体公共组码：图层、颜色、线宽、线型以及图纸空间标志。
#[derive(Debug, Default)]
struct CommonFields {
    layer: Option<String>,
    color: Option<i16>,
    lineweight: Option<i16>,
    linetype: Option<String>,
    paper_space: bool,
}

impl CommonFields {
    /// 识别公共组码，返回是否已消费该组码。
    fn accept(&mut self, code: i32, value: &str, kind: &str) -> Result<bool, DxfError> {
        match code {
            8 => self.layer = Some(value.trim().to_string()),
            62 => self.color = Some(parse_i16(value, &format!("{kind} 颜色（组码 62）"))?),
            370 => self.lineweight = Some(parse_i16(value, &format!("{kind} 线宽（组码 370）"))?),
            6 => self.linetype = Some(value.trim().to_string()),
            67 => self.paper_space = parse_i16(value, &format!("{kind} 空间标志（组码 67）"))? == 1,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn into_attributes(self) -> EntityAttributes {
        let mut attrs = EntityAttributes::on_layer(
            self.layer
                .filter(|layer| !layer.is_empty())
                .unwrap_or_else(|| LAYER_ZERO.to_string()),
        );
        if let Some(color) = self.color {
            attrs.color = color;
        }
        if let Some(lineweight) = self.lineweight {
            attrs.lineweight = lineweight;
        }
        if let Some(linetype) = self.linetype.filter(|linetype| !linetype.is_empty()) {
            attrs.linetype = linetype;
        }
        attrs
    }
}

struct ParsedEntity {
    entity: Entity,
    paper_space: bool,
}

/// 图纸空间块；图纸名要等 OBJECTS 段的 LAYOUT 读完才能确定。
#[derive(Debug)]
struct PaperBlock {
    name: String,
    /// 所属块记录句柄（BLOCK 的组码 330）。
    record: Option<String>,
    description: Option<String>,
    entities: Vec<Entity>,
}

impl PaperBlock {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            record: None,
            description: None,
            entities: Vec::new(),
        }
    }

    fn is_active(&self) -> bool {
        self.name.eq_ignore_ascii_case(ACTIVE_PAPER_BLOCK)
    }
}

pub(crate) struct DxfParser<'a> {
    reader: DxfReader<'a>,
    is_binary: bool,
    paper_blocks: Vec<PaperBlock>,
    /// 块记录句柄（大写）到 LAYOUT 名称。
    layout_names: HashMap<String, String>,
}

impl<'a> DxfParser<'a> {
    pub(crate) fn new(source: &'a str) -> Self {
        Self {
            reader: DxfReader::new(source),
            is_binary: source.starts_with(BINARY_SENTINEL),
            paper_blocks: Vec::new(),
            layout_names: HashMap::new(),
        }
    }

    pub(crate) fn parse(mut self) -> Result<Document, DxfError> {
        if self.is_binary {
            return Err(DxfError::unsupported("二进制 DXF"));
        }
        let mut document = Document::new();
        while let Some((code, value)) = self.reader.next_pair()? {
            if code == 999 {
                continue;
            }
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "意外的组码 {code}（期望 0 表示 SECTION/EOF）"
                )));
            }
            match value.as_str() {
                "SECTION" => {
                    let (name_code, name) = self
                        .reader
                        .next_pair()?
                        .ok_or_else(|| DxfError::invalid("SECTION 缺少名称（组码 2）"))?;
                    if name_code != 2 {
                        return Err(DxfError::invalid(format!(
                            "SECTION 名称使用了组码 {name_code}（期望 2）"
                        )));
                    }
                    match name.as_str() {
                        "TABLES" => self.parse_tables(&mut document)?,
                        "BLOCKS" => self.parse_blocks(&mut document)?,
                        "ENTITIES" => self.parse_entities(&mut document)?,
                        "OBJECTS" => self.parse_objects(&mut document)?,
                        _ => self.skip_section()?,
                    }
                }
                "EOF" => break,
                unexpected => {
                    return Err(DxfError::invalid(format!(
                        "意外的标记 {unexpected}，期望 SECTION 或 EOF"
                    )));
                }
            }
        }
        self.build_sheets(&mut document)?;
        Ok(document)
    }

    /// 有实体或描述的图纸空间块成为图纸。名称依次取 LAYOUT 名、块描述（组码 4）、
    /// 活动布局的默认名，最后是去掉 `*` 的块名。
    fn build_sheets(&mut self, document: &mut Document) -> Result<(), DxfError> {
        for block in std::mem::take(&mut self.paper_blocks) {
            if block.entities.is_empty() && block.description.is_none() {
                continue;
            }
            let layout = block
                .record
                .as_ref()
                .and_then(|record| self.layout_names.get(&record.to_ascii_uppercase()))
                .cloned();
            let is_active = block.is_active();
            let sheet = layout.or(block.description).unwrap_or_else(|| {
                if is_active {
                    DEFAULT_SHEET.to_string()
                } else {
                    block.name.trim_start_matches('*').to_string()
                }
            });
            self.ensure_sheet(document, &sheet)?;
            let space = Space::Sheet(sheet);
            for entity in block.entities {
                add_to_space(document, &space, entity)?;
            }
        }
        Ok(())
    }

    fn paper_block(&mut self, name: &str) -> &mut PaperBlock {
        let index = match self
            .paper_blocks
            .iter()
            .position(|block| block.name.eq_ignore_ascii_case(name))
        {
            Some(index) => index,
            None => {
                self.paper_blocks.push(PaperBlock::new(name));
                self.paper_blocks.len() - 1
            }
        };
        &mut self.paper_blocks[index]
    }

    fn skip_section(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) if value == "ENDSEC" => break,
                Some(_) => continue,
                None => {
                    return Err(DxfError::invalid("SECTION 未找到 ENDSEC 终止标记"));
                }
            }
        }
        Ok(())
    }

    fn skip_entity_body(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        Ok(())
    }

    fn expect_marker(&mut self, section: &str) -> Result<String, DxfError> {
        match self.reader.next_pair()? {
            Some((0, value)) => Ok(value),
            Some((code, _)) => Err(DxfError::invalid(format!(
                "{section} 段遇到组码 {code}（期望 0 表示条目起始）"
            ))),
            None => Err(DxfError::invalid(format!("{section} 段提前结束"))),
        }
    }

    // ---- TABLES ----

    fn parse_tables(&mut self, document: &mut Document) -> Result<(), DxfError> {
        loop {
            match self.expect_marker("TABLES")?.as_str() {
                "ENDSEC" => break,
                "TABLE" => self.parse_table(document)?,
                _ => self.skip_entity_body()?,
            }
        }
        Ok(())
    }

    fn parse_table(&mut self, document: &mut Document) -> Result<(), DxfError> {
        // 表头只有表名有用
        self.skip_entity_body()?;
        loop {
            let record = self.expect_marker("TABLE")?;
            let added = match record.as_str() {
                "ENDTAB" => {
                    self.skip_entity_body()?;
                    break;
                }
                "LAYER" => {
                    let layer = self.parse_layer_record()?;
                    document.add_layer(layer)
                }
                "LTYPE" => {
                    let linetype = self.parse_linetype_record()?;
                    document.add_linetype(linetype)
                }
                "STYLE" => match self.parse_style_record()? {
                    Some(style) => document.add_text_style(style),
                    None => Ok(()),
                },
                _ => {
                    self.skip_entity_body()?;
                    Ok(())
                }
            };
            added.map_err(|err| DxfError::invalid(format!("表记录 {record} 无效：{err}")))?;
        }
        Ok(())
    }

    fn parse_layer_record(&mut self) -> Result<Layer, DxfError> {
        let mut name: Option<String> = None;
        let mut color: i16 = 7;
        let mut lineweight: Option<i16> = None;
        let mut linetype: Option<String> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    2 => name = Some(value.trim().to_string()),
                    62 => color = parse_i16(&value, "LAYER 颜色（组码 62）")?,
                    370 => lineweight = Some(parse_i16(&value, "LAYER 线宽（组码 370）")?),
                    6 => linetype = Some(value.trim().to_string()),
                    _ => {}
                },
                None => return Err(DxfError::invalid("LAYER 记录未正确结束")),
            }
        }

        let name = name.ok_or_else(|| DxfError::invalid("LAYER 缺少名称（组码 2）"))?;
        let mut layer = Layer::new(name);
        // 负颜色号表示图层关闭
        layer.is_visible = color >= 0;
        layer.color = color.saturating_abs();
        if let Some(lineweight) = lineweight {
            layer.lineweight = lineweight;
        }
        if let Some(linetype) = linetype.filter(|linetype| !linetype.is_empty()) {
            layer.linetype = linetype;
        }
        Ok(layer)
    }

    fn parse_linetype_record(&mut self) -> Result<LineType, DxfError> {
        let mut name: Option<String> = None;
        let mut description: Option<String> = None;
        let mut pattern: Vec<f64> = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    2 => name = Some(value.trim().to_string()),
                    3 => description = (!value.is_empty()).then_some(value),
                    49 => pattern.push(parse_f64(&value, "LTYPE 线段长度（组码 49）")?),
                    _ => {}
                },
                None => return Err(DxfError::invalid("LTYPE 记录未正确结束")),
            }
        }
        Ok(LineType {
            name: name.ok_or_else(|| DxfError::invalid("LTYPE 缺少名称（组码 2）"))?,
            description,
            pattern: Some(pattern),
        })
    }

    /// 无名称的 STYLE 记录是形文件引用，返回 None。
    fn parse_style_record(&mut self) -> Result<Option<TextStyle>, DxfError> {
        let mut name: Option<String> = None;
        let mut font: Option<String> = None;
        let mut height: f64 = 0.0;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    2 => name = Some(value.trim().to_string()),
                    3 => {
                        let trimmed = value.trim();
                        if !trimmed.is_empty() {
                            font = Some(trimmed.to_string());
                        }
                    }
                    40 => height = parse_f64(&value, "STYLE 固定字高（组码 40）")?,
                    _ => {}
                },
                None => return Err(DxfError::invalid("STYLE 记录未正确结束")),
            }
        }
        Ok(name
            .filter(|name| !name.is_empty())
            .map(|name| TextStyle { name, font, height }))
    }

    // ---- BLOCKS ----

    fn parse_blocks(&mut self, document: &mut Document) -> Result<(), DxfError> {
        loop {
            match self.expect_marker("BLOCKS")?.as_str() {
                "ENDSEC" => break,
                "BLOCK" => self.parse_block(document)?,
                _ => {
                    // 未预期的条目（例如孤立的 ENDBLK），直接跳过
                    self.skip_entity_body()?;
                }
            }
        }
        Ok(())
    }

    fn parse_block(&mut self, document: &mut Document) -> Result<(), DxfError> {
        let mut name: Option<String> = None;
        let mut record: Option<String> = None;
        let mut description: Option<String> = None;
        let mut base_x: f64 = 0.0;
        let mut base_y: f64 = 0.0;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    2 => name = Some(value.trim().to_string()),
                    4 => {
                        let trimmed = value.trim();
                        if !trimmed.is_empty() {
                            description = Some(trimmed.to_string());
                        }
                    }
                    10 => base_x = parse_f64(&value, "BLOCK 基点 X（组码 10）")?,
                    20 => base_y = parse_f64(&value, "BLOCK 基点 Y（组码 20）")?,
                    330 if record.is_none() => record = Some(value.trim().to_string()),
                    _ => {}
                },
                None => return Err(DxfError::invalid("BLOCK 未正确结束")),
            }
        }
        let name = name.ok_or_else(|| DxfError::invalid("BLOCK 缺少名称（组码 2）"))?;
        let upper = name.to_ascii_uppercase();
        let is_model = upper.starts_with("*MODEL_SPACE");
        let is_paper = upper.starts_with("*PAPER_SPACE");

        // 布局块保留未建模实体；普通块定义只能跳过，炸开时无法变换它们
        let mut entities: Vec<Entity> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        loop {
            let kind = self.expect_marker("BLOCK")?;
            match kind.as_str() {
                "ENDBLK" => {
                    self.skip_entity_body()?;
                    break;
                }
                "ATTDEF" => self.skip_entity_body()?,
                "SEQEND" if !(is_model || is_paper) => self.skip_entity_body()?,
                other if !(is_model || is_paper) && !MODELED_KINDS.contains(&other) => {
                    self.skip_entity_body()?;
                    skipped.push(other.to_string());
                }
                other => entities.push(self.parse_entity(other)?.entity),
            }
        }
        if !skipped.is_empty() {
            warn!(block = %name, count = skipped.len(), kinds = ?skipped, "块定义中含暂不支持的实体，已跳过");
        }

        if is_model {
            for entity in entities {
                document.add_entity(entity);
            }
        } else if is_paper {
            let block = self.paper_block(&name);
            if record.is_some() {
                block.record = record;
            }
            if description.is_some() {
                block.description = description;
            }
            block.entities.extend(entities);
        } else {
            let mut definition = BlockDefinition::new(name);
            definition.base_point = Point2::new(base_x, base_y);
            definition.entities = entities;
            document.add_block_definition(definition);
        }
        Ok(())
    }

    fn ensure_sheet(&self, document: &mut Document, name: &str) -> Result<(), DxfError> {
        if document.has_space(&Space::Sheet(name.to_string())) {
            return Ok(());
        }
        document
            .add_sheet(name)
            .map_err(|err| DxfError::invalid(format!("图纸 {name} 无效：{err}")))
    }

    // ---- ENTITIES ----

    fn parse_entities(&mut self, document: &mut Document) -> Result<(), DxfError> {
        loop {
            let kind = self.expect_marker("ENTITIES")?;
            match kind.as_str() {
                "ENDSEC" => break,
                other => {
                    let parsed = self.parse_entity(other)?;
                    if parsed.paper_space {
                        self.paper_block(ACTIVE_PAPER_BLOCK)
                            .entities
                            .push(parsed.entity);
                    } else {
                        document.add_entity(parsed.entity);
                    }
                }
            }
        }
        Ok(())
    }

    fn parse_entity(&mut self, kind: &str) -> Result<ParsedEntity, DxfError> {
        match kind {
            "LINE" => self.parse_line(),
            "CIRCLE" => self.parse_circle(),
            "ARC" => self.parse_arc(),
            "ELLIPSE" => self.parse_ellipse(),
            "LWPOLYLINE" => self.parse_lwpolyline(),
            "TEXT" => self.parse_text(),
            "MTEXT" => self.parse_mtext(),
            "INSERT" => self.parse_insert(),
            "IMAGE" => self.parse_image(),
            other => self.parse_raw(other),
        }
    }

    /// 未建模的实体：公共组码进入属性；句柄、属主、反应器组、真彩色与扩展数据
    /// 被丢弃（写出时重新生成）；其余组码原样保留。
    fn parse_raw(&mut self, kind: &str) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut pairs: Vec<(i32, String)> = Vec::new();
        // 第一个非 AcDbEntity 子类标记之前都属于公共段
        let mut in_common = true;
        let mut in_group = false;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if code >= 1000 {
                        continue;
                    }
                    if in_common {
                        if in_group {
                            in_group = !(code == 102 && value.trim() == "}");
                            continue;
                        }
                        match code {
                            102 => {
                                in_group = value.trim_start().starts_with('{');
                                continue;
                            }
                            5 | 330..=369 | 390 | 420 | 430 => continue,
                            100 if value.trim() == "AcDbEntity" => continue,
                            100 => in_common = false,
                            _ => {
                                if common.accept(code, &value, kind)? {
                                    continue;
                                }
                            }
                        }
                    }
                    pairs.push((code, value));
                }
                None => return Err(DxfError::invalid(format!("{kind} 未正确结束"))),
            }
        }

        let paper_space = common.paper_space;
        Ok(ParsedEntity {
            entity: Entity::Raw(RawEntity {
                kind: kind.to_string(),
                pairs,
                attrs: common.into_attributes(),
            }),
            paper_space,
        })
    }

    fn parse_line(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut start_x = None;
        let mut start_y = None;
        let mut end_x = None;
        let mut end_y = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "LINE")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut start_x, &value, "LINE 起点 X（组码 10）")?,
                        20 => assign_coord(&mut start_y, &value, "LINE 起点 Y（组码 20）")?,
                        11 => assign_coord(&mut end_x, &value, "LINE 终点 X（组码 11）")?,
                        21 => assign_coord(&mut end_y, &value, "LINE 终点 Y（组码 21）")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("LINE 未正确结束")),
            }
        }

        let sx = start_x.ok_or_else(|| DxfError::invalid("LINE 缺少起点 X（组码 10）"))?;
        let sy = start_y.ok_or_else(|| DxfError::invalid("LINE 缺少起点 Y（组码 20）"))?;
        let ex = end_x.ok_or_else(|| DxfError::invalid("LINE 缺少终点 X（组码 11）"))?;
        let ey = end_y.ok_or_else(|| DxfError::invalid("LINE 缺少终点 Y（组码 21）"))?;

        let paper_space = common.paper_space;
        Ok(ParsedEntity {
            entity: Entity::Line(Line {
                start: Point2::new(sx, sy),
                end: Point2::new(ex, ey),
                attrs: common.into_attributes(),
            }),
            paper_space,
        })
    }

    fn parse_circle(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut center_x = None;
        let mut center_y = None;
        let mut radius = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "CIRCLE")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut center_x, &value, "CIRCLE 圆心 X（组码 10）")?,
                        20 => assign_coord(&mut center_y, &value, "CIRCLE 圆心 Y（组码 20）")?,
                        40 => assign_coord(&mut radius, &value, "CIRCLE 半径（组码 40）")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("CIRCLE 未正确结束")),
            }
        }

        let cx = center_x.ok_or_else(|| DxfError::invalid("CIRCLE 缺少圆心 X（组码 10）"))?;
        let cy = center_y.ok_or_else(|| DxfError::invalid("CIRCLE 缺少圆心 Y（组码 20）"))?;
        let radius = radius.ok_or_else(|| DxfError::invalid("CIRCLE 缺少半径（组码 40）"))?;

        let paper_space = common.paper_space;
        Ok(ParsedEntity {
            entity: Entity::Circle(Circle {
                center: Point2::new(cx, cy),
                radius,
                attrs: common.into_attributes(),
            }),
            paper_space,
        })
    }

    fn parse_arc(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut center_x = None;
        let mut center_y = None;
        let mut radius = None;
        let mut start_angle = None;
        let mut end_angle = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "ARC")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut center_x, &value, "ARC 圆心 X（组码 10）")?,
                        20 => assign_coord(&mut center_y, &value, "ARC 圆心 Y（组码 20）")?,
                        40 => assign_coord(&mut radius, &value, "ARC 半径（组码 40）")?,
                        50 => assign_coord(&mut start_angle, &value, "ARC 起始角（组码 50）")?,
                        51 => assign_coord(&mut end_angle, &value, "ARC 终止角（组码 51）")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("ARC 未正确结束")),
            }
        }

        let cx = center_x.ok_or_else(|| DxfError::invalid("ARC 缺少圆心 X（组码 10）"))?;
        let cy = center_y.ok_or_else(|| DxfError::invalid("ARC 缺少圆心 Y（组码 20）"))?;
        let radius = radius.ok_or_else(|| DxfError::invalid("ARC 缺少半径（组码 40）"))?;
        let start = start_angle.ok_or_else(|| DxfError::invalid("ARC 缺少起始角（组码 50）"))?;
        let end = end_angle.ok_or_else(|| DxfError::invalid("ARC 缺少终止角（组码 51）"))?;

        let paper_space = common.paper_space;
        Ok(ParsedEntity {
            entity: Entity::Arc(Arc {
                center: Point2::new(cx, cy),
                radius,
                start_angle: start.to_radians(),
                end_angle: end.to_radians(),
                attrs: common.into_attributes(),
            }),
            paper_space,
        })
    }

    fn parse_ellipse(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut center_x = None;
        let mut center_y = None;
        let mut major_x = None;
        let mut major_y = None;
        let mut ratio = None;
        let mut start_parameter: f64 = 0.0;
        let mut end_parameter: f64 = std::f64::consts::TAU;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "ELLIPSE")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut center_x, &value, "ELLIPSE 中心 X（组码 10）")?,
                        20 => assign_coord(&mut center_y, &value, "ELLIPSE 中心 Y（组码 20）")?,
                        11 => assign_coord(&mut major_x, &value, "ELLIPSE 长轴 X（组码 11）")?,
                        21 => assign_coord(&mut major_y, &value, "ELLIPSE 长轴 Y（组码 21）")?,
                        40 => assign_coord(&mut ratio, &value, "ELLIPSE 轴比（组码 40）")?,
                        41 => start_parameter = parse_f64(&value, "ELLIPSE 起始参数（组码 41）")?,
                        42 => end_parameter = parse_f64(&value, "ELLIPSE 终止参数（组码 42）")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("ELLIPSE 未正确结束")),
            }
        }

        let cx = center_x.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少中心 X（组码 10）"))?;
        let cy = center_y.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少中心 Y（组码 20）"))?;
        let mx = major_x.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少长轴 X（组码 11）"))?;
        let my = major_y.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少长轴 Y（组码 21）"))?;
        let ratio = ratio.ok_or_else(|| DxfError::invalid("ELLIPSE 缺少轴比（组码 40）"))?;

        let paper_space = common.paper_space;
        Ok(ParsedEntity {
            entity: Entity::Ellipse(Ellipse {
                center: Point2::new(cx, cy),
                major_axis: Vector2::new(mx, my),
                ratio,
                start_parameter,
                end_parameter,
                attrs: common.into_attributes(),
            }),
            paper_space,
        })
    }

    /// 带有 `RevcloudProps` 扩展数据的闭合多段线读回为修订云线。
    fn parse_lwpolyline(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut is_closed = false;
        let mut vertices: Vec<PolylineVertex> = Vec::new();
        let mut pending_x: Option<f64> = None;
        let mut pending_y: Option<f64> = None;
        let mut in_revcloud_xdata = false;
        let mut is_revcloud = false;
        let mut segment_length: Option<f64> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "LWPOLYLINE")? {
                        continue;
                    }
                    match code {
                        70 => {
                            let flag = parse_i32(&value, "LWPOLYLINE 标志（组码 70）")?;
                            is_closed = flag & 0x01 == 0x01;
                        }
                        10 => {
                            let x = parse_f64(&value, "LWPOLYLINE 顶点 X（组码 10）")?;
                            match pending_y.take() {
                                Some(y) => vertices.push(PolylineVertex::new(Point2::new(x, y))),
                                None => {
                                    if pending_x.replace(x).is_some() {
                                        return Err(DxfError::invalid(
                                            "LWPOLYLINE 顶点缺少对应的 Y（组码 20）",
                                        ));
                                    }
                                }
                            }
                        }
                        20 => {
                            let y = parse_f64(&value, "LWPOLYLINE 顶点 Y（组码 20）")?;
                            match pending_x.take() {
                                Some(x) => vertices.push(PolylineVertex::new(Point2::new(x, y))),
                                None => {
                                    if pending_y.replace(y).is_some() {
                                        return Err(DxfError::invalid(
                                            "LWPOLYLINE 顶点缺少对应的 X（组码 10）",
                                        ));
                                    }
                                }
                            }
                        }
                        42 => {
                            let bulge = parse_f64(&value, "LWPOLYLINE 顶点凸度（组码 42）")?;
                            match vertices.last_mut() {
                                Some(vertex) => vertex.bulge = bulge,
                                None => {
                                    return Err(DxfError::invalid(
                                        "LWPOLYLINE 在定义首个顶点前遇到凸度（组码 42）",
                                    ));
                                }
                            }
                        }
                        1001 => {
                            in_revcloud_xdata = value.trim() == REVCLOUD_APPID;
                            is_revcloud |= in_revcloud_xdata;
                        }
                        1040 if in_revcloud_xdata => {
                            segment_length =
                                Some(parse_f64(&value, "LWPOLYLINE 云线弧长（组码 1040）")?);
                        }
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("LWPOLYLINE 未正确结束")),
            }
        }

        if pending_x.is_some() || pending_y.is_some() {
            return Err(DxfError::invalid(
                "LWPOLYLINE 顶点坐标成对出现（组码 10/20），检测到不完整的顶点",
            ));
        }
        if vertices.is_empty() {
            return Err(DxfError::invalid("LWPOLYLINE 未解析到任何顶点"));
        }

        let paper_space = common.paper_space;
        let attrs = common.into_attributes();
        let entity = if is_revcloud {
            Entity::RevisionCloud(RevisionCloud {
                vertices,
                segment_length: segment_length.unwrap_or(0.0),
                attrs,
            })
        } else {
            Entity::Polyline(Polyline {
                vertices,
                is_closed,
                attrs,
            })
        };
        Ok(ParsedEntity {
            entity,
            paper_space,
        })
    }

    fn parse_text(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut insert_x = None;
        let mut insert_y = None;
        let mut height = None;
        let mut rotation_deg = 0.0;
        let mut style: Option<String> = None;
        let mut text: Option<String> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "TEXT")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut insert_x, &value, "TEXT 插入点 X（组码 10）")?,
                        20 => assign_coord(&mut insert_y, &value, "TEXT 插入点 Y（组码 20）")?,
                        40 => assign_coord(&mut height, &value, "TEXT 高度（组码 40）")?,
                        50 => rotation_deg = parse_f64(&value, "TEXT 旋转角（组码 50）")?,
                        7 => style = Some(value.trim().to_string()),
                        1 => match text {
                            Some(ref mut existing) => {
                                existing.push('\n');
                                existing.push_str(&value);
                            }
                            None => text = Some(value),
                        },
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("TEXT 未正确结束")),
            }
        }

        let ix = insert_x.ok_or_else(|| DxfError::invalid("TEXT 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::invalid("TEXT 缺少插入点 Y（组码 20）"))?;
        let height = height.ok_or_else(|| DxfError::invalid("TEXT 缺少文字高度（组码 40）"))?;
        let content = text.ok_or_else(|| DxfError::invalid("TEXT 缺少文本内容（组码 1）"))?;

        let paper_space = common.paper_space;
        Ok(ParsedEntity {
            entity: Entity::Text(Text {
                insert: Point2::new(ix, iy),
                content,
                height,
                rotation: rotation_deg.to_radians(),
                style,
                attrs: common.into_attributes(),
            }),
            paper_space,
        })
    }

    fn parse_mtext(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut insert_x = None;
        let mut insert_y = None;
        let mut height = None;
        let mut reference_width: Option<f64> = None;
        let mut direction_x: Option<f64> = None;
        let mut direction_y: Option<f64> = None;
        let mut rotation_deg: Option<f64> = None;
        let mut attachment_point: i16 = 1;
        let mut style: Option<String> = None;
        let mut fragments: Vec<String> = Vec::new();

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "MTEXT")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut insert_x, &value, "MTEXT 插入点 X（组码 10）")?,
                        20 => assign_coord(&mut insert_y, &value, "MTEXT 插入点 Y（组码 20）")?,
                        40 => assign_coord(&mut height, &value, "MTEXT 高度（组码 40）")?,
                        41 => {
                            let width = parse_f64(&value, "MTEXT 参考宽度（组码 41）")?;
                            reference_width = (width.abs() >= f64::EPSILON).then_some(width);
                        }
                        11 => direction_x = Some(parse_f64(&value, "MTEXT 方向向量 X（组码 11）")?),
                        21 => direction_y = Some(parse_f64(&value, "MTEXT 方向向量 Y（组码 21）")?),
                        50 => rotation_deg = Some(parse_f64(&value, "MTEXT 旋转角（组码 50）")?),
                        71 => attachment_point = parse_i16(&value, "MTEXT 附着点（组码 71）")?,
                        7 => style = Some(value.trim().to_string()),
                        1 | 3 => fragments.push(value),
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("MTEXT 未正确结束")),
            }
        }

        let ix = insert_x.ok_or_else(|| DxfError::invalid("MTEXT 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::invalid("MTEXT 缺少插入点 Y（组码 20）"))?;
        let height = height.ok_or_else(|| DxfError::invalid("MTEXT 缺少文本高度（组码 40）"))?;
        if fragments.is_empty() {
            return Err(DxfError::invalid("MTEXT 缺少内容（组码 1/3）"));
        }
        let content = decode_mtext_content(&fragments.concat());

        let direction = match (direction_x, direction_y) {
            (Some(x), Some(y)) if x.abs() >= f64::EPSILON || y.abs() >= f64::EPSILON => {
                Vector2::new(x, y)
            }
            _ => match rotation_deg {
                Some(rot) => {
                    let rad = rot.to_radians();
                    Vector2::new(rad.cos(), rad.sin())
                }
                None => Vector2::new(1.0, 0.0),
            },
        };

        let paper_space = common.paper_space;
        Ok(ParsedEntity {
            entity: Entity::MText(MText {
                insert: Point2::new(ix, iy),
                content,
                height,
                reference_width,
                direction,
                attachment_point,
                style,
                attrs: common.into_attributes(),
            }),
            paper_space,
        })
    }

    fn parse_insert(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut name = None;
        let mut insert_x = None;
        let mut insert_y = None;
        let mut scale_x: Option<f64> = None;
        let mut scale_y: Option<f64> = None;
        let mut rotation_deg: f64 = 0.0;

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "INSERT")? {
                        continue;
                    }
                    match code {
                        2 => {
                            if name.is_some() {
                                return Err(DxfError::invalid("INSERT 遇到重复的块名（组码 2）"));
                            }
                            name = Some(value.trim().to_string());
                        }
                        10 => assign_coord(&mut insert_x, &value, "INSERT 插入点 X（组码 10）")?,
                        20 => assign_coord(&mut insert_y, &value, "INSERT 插入点 Y（组码 20）")?,
                        41 => scale_x = Some(parse_f64(&value, "INSERT 缩放 X（组码 41）")?),
                        42 => scale_y = Some(parse_f64(&value, "INSERT 缩放 Y（组码 42）")?),
                        50 => rotation_deg = parse_f64(&value, "INSERT 旋转角（组码 50）")?,
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("INSERT 未正确结束")),
            }
        }

        let name = name.ok_or_else(|| DxfError::invalid("INSERT 缺少块名（组码 2）"))?;
        let ix = insert_x.ok_or_else(|| DxfError::invalid("INSERT 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::invalid("INSERT 缺少插入点 Y（组码 20）"))?;
        let sx = scale_x.unwrap_or(1.0);
        let sy = scale_y.unwrap_or(sx);

        let mut attributes: Vec<Attribute> = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.as_str() {
                    "ATTRIB" => attributes.push(self.parse_attrib()?),
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        self.reader.put_back((0, value));
                        break;
                    }
                },
                Some((code, value)) => {
                    return Err(DxfError::invalid(format!(
                        "INSERT 属性段出现意外组码 {code} 值 {value}"
                    )));
                }
                None => break,
            }
        }

        let paper_space = common.paper_space;
        Ok(ParsedEntity {
            entity: Entity::BlockReference(BlockReference {
                name,
                insert: Point2::new(ix, iy),
                scale: Vector2::new(sx, sy),
                rotation: rotation_deg.to_radians(),
                attributes,
                attrs: common.into_attributes(),
            }),
            paper_space,
        })
    }

    fn parse_attrib(&mut self) -> Result<Attribute, DxfError> {
        let mut common = CommonFields::default();
        let mut insert_x = None;
        let mut insert_y = None;
        let mut height: Option<f64> = None;
        let mut rotation_deg: f64 = 0.0;
        let mut text: Option<String> = None;
        let mut tag: Option<String> = None;
        let mut style: Option<String> = None;

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "ATTRIB")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut insert_x, &value, "ATTRIB 插入点 X（组码 10）")?,
                        20 => assign_coord(&mut insert_y, &value, "ATTRIB 插入点 Y（组码 20）")?,
                        40 => height = Some(parse_f64(&value, "ATTRIB 高度（组码 40）")?),
                        50 => rotation_deg = parse_f64(&value, "ATTRIB 旋转角（组码 50）")?,
                        1 => match text {
                            Some(ref mut existing) => {
                                existing.push('\n');
                                existing.push_str(&value);
                            }
                            None => text = Some(value),
                        },
                        2 => tag = Some(value.trim().to_string()),
                        7 => style = Some(value.trim().to_string()),
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("ATTRIB 未正确结束")),
            }
        }

        let ix = insert_x.ok_or_else(|| DxfError::invalid("ATTRIB 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::invalid("ATTRIB 缺少插入点 Y（组码 20）"))?;
        let text = text.ok_or_else(|| DxfError::invalid("ATTRIB 缺少文本内容（组码 1）"))?;
        let tag = tag.ok_or_else(|| DxfError::invalid("ATTRIB 缺少标记（组码 2）"))?;

        Ok(Attribute {
            tag,
            text: decode_inline_text(&text),
            insert: Point2::new(ix, iy),
            height: height.unwrap_or(0.0),
            rotation: rotation_deg.to_radians(),
            style,
            attrs: common.into_attributes(),
        })
    }

    fn parse_image(&mut self) -> Result<ParsedEntity, DxfError> {
        let mut common = CommonFields::default();
        let mut image_def_handle: Option<String> = None;
        let mut insert_x: Option<f64> = None;
        let mut insert_y: Option<f64> = None;
        let mut u_vec = (1.0, 0.0);
        let mut v_vec = (0.0, 1.0);
        let mut size = (0.0, 0.0);

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => {
                    if common.accept(code, &value, "IMAGE")? {
                        continue;
                    }
                    match code {
                        10 => assign_coord(&mut insert_x, &value, "IMAGE 插入点 X（组码 10）")?,
                        20 => assign_coord(&mut insert_y, &value, "IMAGE 插入点 Y（组码 20）")?,
                        11 => u_vec.0 = parse_f64(&value, "IMAGE U 向量 X（组码 11）")?,
                        21 => u_vec.1 = parse_f64(&value, "IMAGE U 向量 Y（组码 21）")?,
                        12 => v_vec.0 = parse_f64(&value, "IMAGE V 向量 X（组码 12）")?,
                        22 => v_vec.1 = parse_f64(&value, "IMAGE V 向量 Y（组码 22）")?,
                        13 => size.0 = parse_f64(&value, "IMAGE 像素宽度（组码 13）")?,
                        23 => size.1 = parse_f64(&value, "IMAGE 像素高度（组码 23）")?,
                        340 => image_def_handle = Some(value.trim().to_string()),
                        _ => {}
                    }
                }
                None => return Err(DxfError::invalid("IMAGE 未正确结束")),
            }
        }

        let ix = insert_x.ok_or_else(|| DxfError::invalid("IMAGE 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::invalid("IMAGE 缺少插入点 Y（组码 20）"))?;
        let handle = image_def_handle
            .ok_or_else(|| DxfError::invalid("IMAGE 缺少图像定义句柄（组码 340）"))?;

        let paper_space = common.paper_space;
        Ok(ParsedEntity {
            entity: Entity::RasterImage(RasterImage {
                image_def_handle: handle,
                insert: Point2::new(ix, iy),
                u_vector: Vector2::new(u_vec.0, u_vec.1),
                v_vector: Vector2::new(v_vec.0, v_vec.1),
                image_size: Vector2::new(size.0, size.1),
                attrs: common.into_attributes(),
            }),
            paper_space,
        })
    }

    // ---- OBJECTS ----

    fn parse_objects(&mut self, document: &mut Document) -> Result<(), DxfError> {
        loop {
            match self.expect_marker("OBJECTS")?.as_str() {
                "ENDSEC" => break,
                "IMAGEDEF" => {
                    let definition = self.parse_image_def()?;
                    document.add_image_definition(definition);
                }
                "LAYOUT" => self.parse_layout()?,
                _ => self.skip_entity_body()?,
            }
        }
        Ok(())
    }

    /// 只取 AcDbLayout 子类中的布局名（组码 1）与块记录句柄（组码 330）。
    fn parse_layout(&mut self) -> Result<(), DxfError> {
        let mut in_layout = false;
        let mut name: Option<String> = None;
        let mut record: Option<String> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    100 => in_layout = value.trim() == "AcDbLayout",
                    1 if in_layout => name = Some(value.trim().to_string()),
                    330 if in_layout => record = Some(value.trim().to_ascii_uppercase()),
                    _ => {}
                },
                None => return Err(DxfError::invalid("LAYOUT 未正确结束")),
            }
        }
        if let (Some(name), Some(record)) = (name, record) {
            if !name.is_empty() {
                self.layout_names.insert(record, name);
            }
        }
        Ok(())
    }

    fn parse_image_def(&mut self) -> Result<RasterImageDefinition, DxfError> {
        let mut handle: Option<String> = None;
        let mut file_path: Option<String> = None;
        let mut size_x: Option<f64> = None;
        let mut size_y: Option<f64> = None;

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value));
                    break;
                }
                Some((code, value)) => match code {
                    5 => handle = Some(value.trim().to_string()),
                    1 => file_path = Some(value.trim().to_string()),
                    10 => size_x = Some(parse_f64(&value, "IMAGEDEF 像素宽度（组码 10）")?),
                    20 => size_y = Some(parse_f64(&value, "IMAGEDEF 像素高度（组码 20）")?),
                    _ => {}
                },
                None => return Err(DxfError::invalid("IMAGEDEF 未正确结束")),
            }
        }

        let handle = handle.ok_or_else(|| DxfError::invalid("IMAGEDEF 缺少句柄（组码 5）"))?;
        let file_path =
            file_path.ok_or_else(|| DxfError::invalid("IMAGEDEF 缺少文件路径（组码 1）"))?;
        let image_size_pixels = match (size_x, size_y) {
            (Some(x), Some(y)) => Some(Vector2::new(x, y)),
            _ => None,
        };

        Ok(RasterImageDefinition {
            handle,
            file_path,
            image_size_pixels,
        })
    }
}

fn add_to_space(document: &mut Document, space: &Space, entity: Entity) -> Result<(), DxfError> {
    document
        .add_entity_to(space, entity)
        .map(|_| ())
        .map_err(|err| DxfError::invalid(format!("无法放入 {space}：{err}")))
}

struct DxfReader<'a> {
    lines: std::str::Lines<'a>,
    buffer: Option<(i32, String)>,
    line_number: usize,
}

impl<'a> DxfReader<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            lines: source.lines(),
            buffer: None,
            line_number: 0,
        }
    }

    fn next_pair(&mut self) -> Result<Option<(i32, String)>, DxfError> {
        if let Some(pair) = self.buffer.take() {
            return Ok(Some(pair));
        }

        let code_line = loop {
            match self.lines.next() {
                Some(line) => {
                    self.line_number += 1;
                    // 容忍文件末尾的空行
                    if !line.trim().is_empty() {
                        break line;
                    }
                }
                None => return Ok(None),
            }
        };

        let value_line = match self.lines.next() {
            Some(line) => {
                self.line_number += 1;
                line
            }
            None => {
                return Err(DxfError::invalid(format!(
                    "文件在第 {} 行结束，缺少与组码对应的值行",
                    self.line_number
                )));
            }
        };

        let code = code_line.trim().parse::<i32>().map_err(|_| {
            DxfError::invalid(format!(
                "第 {} 行的组码 \"{}\" 无法解析为整数",
                self.line_number - 1,
                code_line.trim()
            ))
        })?;
        let value = decode_unicode_escapes(value_line.trim_end_matches('\r'));
        Ok(Some((code, value)))
    }

    /// 回退一个组码对；解析器每次最多回看一个组码对。
    fn put_back(&mut self, pair: (i32, String)) {
        debug_assert!(self.buffer.is_none(), "DXF 组码对只能回退一次");
        self.buffer = Some(pair);
    }
}

fn assign_coord(slot: &mut Option<f64>, raw: &str, context: &str) -> Result<(), DxfError> {
    if slot.is_some() {
        return Err(DxfError::invalid(format!("{context} 出现重复值")));
    }
    *slot = Some(parse_f64(raw, context)?);
    Ok(())
}

fn parse_f64(raw: &str, context: &str) -> Result<f64, DxfError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| DxfError::invalid(format!("{context} 解析失败（值：\"{raw}\"）")))
}

fn parse_i32(raw: &str, context: &str) -> Result<i32, DxfError> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| DxfError::invalid(format!("{context} 解析失败（值：\"{raw}\"）")))
}

fn parse_i16(raw: &str, context: &str) -> Result<i16, DxfError> {
    let value = parse_i32(raw, context)?;
    i16::try_from(value)
        .map_err(|_| DxfError::invalid(format!("{context} 超出 i16 范围（值：{value}）")))
}

/// 还原 `\U+XXXX`（UTF-16 码元），相邻的代理对组合成一个字符。
/// 转义的反斜杠（`\\`）原样保留，留给 MTEXT 解码处理。
fn decode_unicode_escapes(raw: &str) -> String {
    if !raw.contains("\\U+") && !raw.contains("\\u+") {
        return raw.to_string();
    }
    let mut result = String::with_capacity(raw.len());
    let mut units: Vec<u16> = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        if let Some(unit) = escaped_unit(rest) {
            units.push(unit);
            rest = &rest[7..];
            continue;
        }
        flush_units(&mut result, &mut units);
        if let Some(tail) = rest.strip_prefix("\\\\") {
            result.push_str("\\\\");
            rest = tail;
            continue;
        }
        let mut chars = rest.chars();
        if let Some(ch) = chars.next() {
            result.push(ch);
        }
        rest = chars.as_str();
    }
    flush_units(&mut result, &mut units);
    result
}

fn escaped_unit(rest: &str) -> Option<u16> {
    let bytes = rest.as_bytes();
    if bytes.len() < 7 || bytes[0] != b'\\' || !bytes[1].eq_ignore_ascii_case(&b'U') || bytes[2] != b'+' {
        return None;
    }
    let digits = rest.get(3..7)?;
    if !digits.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

fn flush_units(result: &mut String, units: &mut Vec<u16>) {
    result.extend(
        char::decode_utf16(units.drain(..))
            .map(|decoded| decoded.unwrap_or(char::REPLACEMENT_CHARACTER)),
    );
}

fn decode_mtext_content(raw: &str) -> String {
    let mut result = String::new();
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('P') | Some('p') => result.push('\n'),
                Some('~') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(ch);
        }
    }
    result
}

fn decode_inline_text(raw: &str) -> String {
    let mut result = String::new();
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('P') | Some('p') => result.push('\n'),
                Some('~') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some('S') | Some('s') => {
                    // 跳过堆叠分数段
                    for next in chars.by_ref() {
                        if next == ';' {
                            break;
                        }
                    }
                }
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(ch);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Result<Document, DxfError> {
        DxfParser::new(source).parse()
    }

    #[test]
    fn mtext_escapes_are_decoded() {
        assert_eq!(decode_mtext_content(r"A\PB\~C\\D"), "A\nB C\\D");
        assert_eq!(decode_inline_text(r"1\S1/2;x"), "1x");
    }

    #[test]
    fn unicode_escapes_are_decoded() {
        assert_eq!(decode_unicode_escapes(r"\U+56FEA"), "图A");
        assert_eq!(decode_unicode_escapes(r"\U+D83D\U+DE00"), "😀");
        // 不完整的转义与转义的反斜杠保持原样
        assert_eq!(decode_unicode_escapes(r"\U+12"), r"\U+12");
        assert_eq!(decode_unicode_escapes(r"C:\\U+0041"), r"C:\\U+0041");
        assert_eq!(decode_unicode_escapes("plain"), "plain");
    }

    #[test]
    fn common_codes_fill_attributes() {
        let source = "0\nSECTION\n2\nENTITIES\n0\nLINE\n8\nWALLS\n62\n3\n370\n25\n6\nDASHED\n10\n0\n20\n0\n11\n5\n21\n0\n0\nENDSEC\n0\nEOF\n";
        let doc = parse(source).expect("解析 LINE");
        let (_, entity) = doc.entities().next().expect("存在一个实体");
        let attrs = entity.attributes();
        assert_eq!(attrs.layer, "WALLS");
        assert_eq!(attrs.color, 3);
        assert_eq!(attrs.lineweight, 25);
        assert_eq!(attrs.linetype, "DASHED");
        assert!(doc.has_layer("walls"));
    }

    #[test]
    fn unknown_entity_is_kept_with_its_pairs() {
        let source = "0\nSECTION\n2\nENTITIES\n0\nHATCH\n5\n2A\n102\n{ACAD_REACTORS\n330\n2B\n102\n}\n330\n1F\n100\nAcDbEntity\n8\nFILL\n62\n1\n100\nAcDbHatch\n2\nSOLID\n70\n1\n1001\nACAD\n1070\n0\n0\nENDSEC\n0\nEOF\n";
        let doc = parse(source).expect("未建模实体不应导致失败");
        let (_, entity) = doc.entities().next().expect("存在一个实体");
        match entity {
            Entity::Raw(raw) => {
                assert_eq!(raw.kind, "HATCH");
                assert_eq!(raw.attrs.layer, "FILL");
                assert_eq!(raw.attrs.color, 1);
                let codes: Vec<i32> = raw.pairs.iter().map(|(code, _)| *code).collect();
                assert_eq!(codes, vec![100, 2, 70], "句柄、属主、反应器与扩展数据均被剥离");
                assert_eq!(raw.pairs[0].1, "AcDbHatch");
            }
            other => panic!("期望未建模实体，得到 {other:?}"),
        }
        assert!(doc.has_layer("FILL"));
    }

    #[test]
    fn block_with_hatch_and_paper_viewport_are_loaded() {
        let source = concat!(
            "0\nSECTION\n2\nBLOCKS\n",
            "0\nBLOCK\n8\n0\n2\nTAG\n70\n0\n10\n0\n20\n0\n",
            "0\nHATCH\n8\nFILL\n100\nAcDbHatch\n2\nSOLID\n",
            "0\nLINE\n8\nGEOM\n10\n0\n20\n0\n11\n1\n21\n1\n",
            "0\nENDBLK\n0\nENDSEC\n",
            "0\nSECTION\n2\nENTITIES\n",
            "0\nVIEWPORT\n8\n0\n67\n1\n100\nAcDbViewport\n10\n100\n20\n50\n69\n1\n",
            "0\nENDSEC\n0\nEOF\n",
        );
        let doc = parse(source).expect("含 HATCH 的块与图纸空间视口应能读取");

        let block = doc.block("TAG").expect("块定义仍然存在");
        assert_eq!(block.entities.len(), 1, "块内 HATCH 被跳过，LINE 保留");
        assert_eq!(block.entities[0].kind_name(), "LINE");

        let sheet = Space::Sheet("Layout1".to_string());
        let entities = doc.space_entities(&sheet).expect("视口落在默认图纸");
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].1.kind_name(), "VIEWPORT");
        assert_eq!(doc.entities().count(), 0);
    }

    #[test]
    fn layout_objects_name_paper_space_blocks() {
        let source = concat!(
            "0\nSECTION\n2\nBLOCKS\n",
            "0\nBLOCK\n5\n20\n330\n1E\n100\nAcDbEntity\n67\n1\n8\n0\n100\nAcDbBlockBegin\n2\n*Paper_Space0\n70\n0\n10\n0\n20\n0\n",
            "0\nCIRCLE\n5\n30\n330\n1E\n100\nAcDbEntity\n67\n1\n8\nTITLE\n100\nAcDbCircle\n10\n1\n20\n1\n40\n2\n",
            "0\nENDBLK\n5\n21\n330\n1E\n100\nAcDbEntity\n8\n0\n100\nAcDbBlockEnd\n",
            "0\nENDSEC\n",
            "0\nSECTION\n2\nOBJECTS\n",
            "0\nLAYOUT\n5\n40\n330\n1A\n100\nAcDbPlotSettings\n1\n\n100\nAcDbLayout\n1\nFL7\n70\n1\n71\n1\n330\n1e\n",
            "0\nENDSEC\n0\nEOF\n",
        );
        let doc = parse(source).expect("解析布局");
        assert_eq!(doc.sheet_names().collect::<Vec<_>>(), vec!["FL7"]);
        let entities = doc.space_entities(&Space::Sheet("FL7".to_string())).unwrap();
        assert_eq!(entities.len(), 1);
    }

    #[test]
    fn binary_dxf_is_unsupported() {
        match parse("AutoCAD Binary DXF\r\n\u{1a}\0") {
            Err(DxfError::Unsupported { feature }) => assert!(feature.contains("二进制")),
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn paper_space_entities_land_in_default_sheet() {
        let source = "0\nSECTION\n2\nENTITIES\n0\nCIRCLE\n8\nTITLE\n67\n1\n10\n1\n20\n1\n40\n2\n0\nENDSEC\n0\nEOF\n";
        let doc = parse(source).expect("解析图纸空间实体");
        assert_eq!(doc.entities().count(), 0);
        let sheet = Space::Sheet("Layout1".to_string());
        assert_eq!(doc.space_entities(&sheet).map(|e| e.len()).ok(), Some(1));
    }

    #[test]
    fn truncated_pair_is_invalid() {
        assert!(matches!(parse("0\nSECTION\n2"), Err(DxfError::Invalid { .. })));
    }
}
