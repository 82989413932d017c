use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::DocumentError;
use crate::geometry::{Point2, Vector2};
use crate::transform::InsertTransform;

/// 颜色号 256 表示“随层”（BYLAYER）。
pub const COLOR_BYLAYER: i16 = 256;
/// 颜色号 0 表示“随块”（BYBLOCK）。
pub const COLOR_BYBLOCK: i16 = 0;
pub const LINEWEIGHT_BYLAYER: i16 = -1;
pub const LINEWEIGHT_BYBLOCK: i16 = -2;
pub const LINEWEIGHT_DEFAULT: i16 = -3;
pub const LINETYPE_BYLAYER: &str = "BYLAYER";
pub const LINETYPE_BYBLOCK: &str = "BYBLOCK";
pub const LINETYPE_CONTINUOUS: &str = "CONTINUOUS";
pub const LAYER_ZERO: &str = "0";
pub const LAYER_DEFPOINTS: &str = "Defpoints";

const INVALID_NAME_CHARS: &[char] = &['<', '>', '/', '\\', '"', ':', ';', '?', '*', '|', '=', '`'];

/// DXF 表名大小写不敏感，统一使用大写作为索引键。
#[inline]
fn table_key(name: &str) -> String {
    name.to_ascii_uppercase()
}

fn validate_table_name(kind: &'static str, name: &str) -> Result<(), DocumentError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.len() != name.len()
        || name.chars().any(|ch| INVALID_NAME_CHARS.contains(&ch) || ch.is_control())
    {
        return Err(DocumentError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    #[inline]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 提供原始数值，便于日志输出。
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// 实体所在的空间：模型空间或命名图纸（布局）。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Space {
    Model,
    Sheet(String),
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Space::Model => write!(f, "*Model_Space"),
            Space::Sheet(name) => write!(f, "sheet {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub color: i16,
    /// 以 1/100 mm 为单位的线宽，负值为特殊含义（默认、随层等）。
    pub lineweight: i16,
    pub linetype: String,
    pub is_visible: bool,
}

impl Layer {
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: 7,
            lineweight: LINEWEIGHT_DEFAULT,
            linetype: LINETYPE_CONTINUOUS.to_string(),
            is_visible: true,
        }
    }

    #[inline]
    pub fn with_color(name: impl Into<String>, color: i16) -> Self {
        Self {
            color,
            ..Self::new(name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineType {
    pub name: String,
    pub description: Option<String>,
    /// 虚线模式：正值为实线段长度，负值为空白长度。
    pub pattern: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStyle {
    pub name: String,
    pub font: Option<String>,
    pub height: f64,
}

/// 所有实体共有的显示属性。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAttributes {
    pub layer: String,
    pub color: i16,
    pub lineweight: i16,
    pub linetype: String,
}

impl EntityAttributes {
    pub fn on_layer(layer: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            color: COLOR_BYLAYER,
            lineweight: LINEWEIGHT_BYLAYER,
            linetype: LINETYPE_BYLAYER.to_string(),
        }
    }

    /// 颜色、线宽、线型全部改为随层。
    pub fn reset_to_bylayer(&mut self) {
        self.color = COLOR_BYLAYER;
        self.lineweight = LINEWEIGHT_BYLAYER;
        self.linetype = LINETYPE_BYLAYER.to_string();
    }

    pub fn is_bylayer(&self) -> bool {
        self.color == COLOR_BYLAYER
            && self.lineweight == LINEWEIGHT_BYLAYER
            && self.linetype.eq_ignore_ascii_case(LINETYPE_BYLAYER)
    }

    /// 块内实体炸开时继承块参照属性：0 层取参照图层，BYBLOCK 取参照取值。
    pub fn inherit_from(&mut self, reference: &EntityAttributes) {
        if self.layer == LAYER_ZERO {
            self.layer = reference.layer.clone();
        }
        if self.color == COLOR_BYBLOCK {
            self.color = reference.color;
        }
        if self.lineweight == LINEWEIGHT_BYBLOCK {
            self.lineweight = reference.lineweight;
        }
        if self.linetype.eq_ignore_ascii_case(LINETYPE_BYBLOCK) {
            self.linetype = reference.linetype.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Line(Line),
    Circle(Circle),
    Arc(Arc),
    Ellipse(Ellipse),
    Polyline(Polyline),
    Text(Text),
    MText(MText),
    BlockReference(BlockReference),
    RasterImage(RasterImage),
    RevisionCloud(RevisionCloud),
    Raw(RawEntity),
}

impl Entity {
    /// DXF 实体类型名，用于日志。
    pub fn kind_name(&self) -> &str {
        match self {
            Entity::Line(_) => "LINE",
            Entity::Circle(_) => "CIRCLE",
            Entity::Arc(_) => "ARC",
            Entity::Ellipse(_) => "ELLIPSE",
            Entity::Polyline(_) => "LWPOLYLINE",
            Entity::Text(_) => "TEXT",
            Entity::MText(_) => "MTEXT",
            Entity::BlockReference(_) => "INSERT",
            Entity::RasterImage(_) => "IMAGE",
            Entity::RevisionCloud(_) => "REVCLOUD",
            Entity::Raw(raw) => &raw.kind,
        }
    }

    pub fn attributes(&self) -> &EntityAttributes {
        match self {
            Entity::Line(line) => &line.attrs,
            Entity::Circle(circle) => &circle.attrs,
            Entity::Arc(arc) => &arc.attrs,
            Entity::Ellipse(ellipse) => &ellipse.attrs,
            Entity::Polyline(polyline) => &polyline.attrs,
            Entity::Text(text) => &text.attrs,
            Entity::MText(mtext) => &mtext.attrs,
            Entity::BlockReference(reference) => &reference.attrs,
            Entity::RasterImage(image) => &image.attrs,
            Entity::RevisionCloud(cloud) => &cloud.attrs,
            Entity::Raw(raw) => &raw.attrs,
        }
    }

    pub fn attributes_mut(&mut self) -> &mut EntityAttributes {
        match self {
            Entity::Line(line) => &mut line.attrs,
            Entity::Circle(circle) => &mut circle.attrs,
            Entity::Arc(arc) => &mut arc.attrs,
            Entity::Ellipse(ellipse) => &mut ellipse.attrs,
            Entity::Polyline(polyline) => &mut polyline.attrs,
            Entity::Text(text) => &mut text.attrs,
            Entity::MText(mtext) => &mut mtext.attrs,
            Entity::BlockReference(reference) => &mut reference.attrs,
            Entity::RasterImage(image) => &mut image.attrs,
            Entity::RevisionCloud(cloud) => &mut cloud.attrs,
            Entity::Raw(raw) => &mut raw.attrs,
        }
    }

    #[inline]
    pub fn layer_name(&self) -> &str {
        &self.attributes().layer
    }

    #[inline]
    pub fn set_layer(&mut self, layer: impl Into<String>) {
        self.attributes_mut().layer = layer.into();
    }

    /// 块参照所引用的块名。
    #[inline]
    pub fn block_name(&self) -> Option<&str> {
        match self {
            Entity::BlockReference(reference) => Some(&reference.name),
            _ => None,
        }
    }

    #[inline]
    pub fn is_raster_image(&self) -> bool {
        matches!(self, Entity::RasterImage(_))
    }

    /// 闭合多段线的顶点序列（至少三个不同顶点），其它实体返回 None。
    /// 若末顶点与首顶点重合则去掉重复的闭合点。
    pub fn closed_boundary(&self) -> Option<Vec<Point2>> {
        let Entity::Polyline(polyline) = self else {
            return None;
        };
        if !polyline.is_closed {
            return None;
        }
        let mut points: Vec<Point2> = polyline
            .vertices
            .iter()
            .map(|vertex| vertex.position)
            .collect();
        if points.len() > 1 {
            let first = points[0];
            if points
                .last()
                .is_some_and(|last| last.is_close(first, 1e-9))
            {
                points.pop();
            }
        }
        if points.len() < 3 { None } else { Some(points) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub start: Point2,
    pub end: Point2,
    pub attrs: EntityAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub center: Point2,
    pub radius: f64,
    pub attrs: EntityAttributes,
}

/// 圆弧实体，角度以弧度形式储存，遵循数学正方向。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arc {
    pub center: Point2,
    pub radius: f64,
    pub start_angle: f64,
    pub end_angle: f64,
    pub attrs: EntityAttributes,
}

/// 椭圆实体，记录主轴向量与参数范围（单位为弧度）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ellipse {
    pub center: Point2,
    pub major_axis: Vector2,
    pub ratio: f64,
    pub start_parameter: f64,
    pub end_parameter: f64,
    pub attrs: EntityAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline {
    pub vertices: Vec<PolylineVertex>,
    pub is_closed: bool,
    pub attrs: EntityAttributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolylineVertex {
    pub position: Point2,
    pub bulge: f64,
}

impl PolylineVertex {
    #[inline]
    pub fn new(position: Point2) -> Self {
        Self {
            position,
            bulge: 0.0,
        }
    }

    #[inline]
    pub fn with_bulge(position: Point2, bulge: f64) -> Self {
        Self { position, bulge }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub insert: Point2,
    pub content: String,
    pub height: f64,
    pub rotation: f64,
    pub style: Option<String>,
    pub attrs: EntityAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MText {
    pub insert: Point2,
    pub content: String,
    pub height: f64,
    pub reference_width: Option<f64>,
    pub direction: Vector2,
    pub attachment_point: i16,
    pub style: Option<String>,
    pub attrs: EntityAttributes,
}

/// 块参照上的属性值（ATTRIB），坐标已处于世界坐标系。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub tag: String,
    pub text: String,
    pub insert: Point2,
    pub height: f64,
    pub rotation: f64,
    pub style: Option<String>,
    pub attrs: EntityAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockReference {
    pub name: String,
    pub insert: Point2,
    pub scale: Vector2,
    pub rotation: f64,
    pub attributes: Vec<Attribute>,
    pub attrs: EntityAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterImage {
    pub image_def_handle: String,
    pub insert: Point2,
    pub u_vector: Vector2,
    pub v_vector: Vector2,
    pub image_size: Vector2,
    pub attrs: EntityAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterImageDefinition {
    pub handle: String,
    pub file_path: String,
    pub image_size_pixels: Option<Vector2>,
}

/// 修订云线：带凸度的闭合多段线，`segment_length` 为生成时的弧段长度。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionCloud {
    pub vertices: Vec<PolylineVertex>,
    pub segment_length: f64,
    pub attrs: EntityAttributes,
}

/// 未建模的实体（HATCH、VIEWPORT、DIMENSION 等）。
///
/// 读取时剥离句柄、属主与扩展数据，公共属性进入 `attrs`，其余组码按原顺序
/// 保存在 `pairs` 中，写出时原样追加在公共属性之后。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntity {
    pub kind: String,
    pub pairs: Vec<(i32, String)>,
    pub attrs: EntityAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub name: String,
    pub base_point: Point2,
    pub entities: Vec<Entity>,
}

impl BlockDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_point: Point2::new(0.0, 0.0),
            entities: Vec::new(),
        }
    }

    /// 块内直接引用的其它块名，按首次出现顺序去重。
    pub fn referenced_blocks(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for entity in &self.entities {
            if let Some(name) = entity.block_name() {
                if !names.iter().any(|existing| existing.eq_ignore_ascii_case(name)) {
                    names.push(name);
                }
            }
        }
        names
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Sheet {
    name: String,
    entities: Vec<(EntityId, Entity)>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Document {
    layers: IndexMap<String, Layer>,
    linetypes: IndexMap<String, LineType>,
    text_styles: IndexMap<String, TextStyle>,
    blocks: IndexMap<String, BlockDefinition>,
    image_definitions: IndexMap<String, RasterImageDefinition>,
    entities: Vec<(EntityId, Entity)>,
    sheets: IndexMap<String, Sheet>,
    next_entity_id: u64,
    next_handle: u64,
}

impl Document {
    /// 新建文档，带有 0 图层、基础线型与 Standard 文字样式。
    pub fn new() -> Self {
        let mut doc = Self::default();
        doc.ensure_layer(LAYER_ZERO);
        for name in [LINETYPE_BYBLOCK, LINETYPE_BYLAYER, LINETYPE_CONTINUOUS] {
            doc.linetypes.insert(
                table_key(name),
                LineType {
                    name: name.to_string(),
                    description: Some(String::new()),
                    pattern: Some(Vec::new()),
                },
            );
        }
        doc.text_styles.insert(
            table_key("Standard"),
            TextStyle {
                name: "Standard".to_string(),
                font: Some("txt".to_string()),
                height: 0.0,
            },
        );
        doc
    }

    // ---- 图层 ----

    pub fn ensure_layer(&mut self, name: impl AsRef<str>) {
        let name = name.as_ref();
        self.layers
            .entry(table_key(name))
            .or_insert_with(|| Layer::new(name));
    }

    /// 添加或覆盖图层定义。
    pub fn add_layer(&mut self, layer: Layer) -> Result<(), DocumentError> {
        validate_table_name("layer", &layer.name)?;
        self.layers.insert(table_key(&layer.name), layer);
        Ok(())
    }

    #[inline]
    pub fn has_layer(&self, name: &str) -> bool {
        self.layers.contains_key(&table_key(name))
    }

    #[inline]
    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.get(&table_key(name))
    }

    #[inline]
    pub fn layer_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers.get_mut(&table_key(name))
    }

    #[inline]
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers.values().map(|layer| layer.name.clone()).collect()
    }

    /// 删除图层。0 图层是 DXF 必需的，始终拒绝删除。
    pub fn remove_layer(&mut self, name: &str) -> Result<Layer, DocumentError> {
        if name == LAYER_ZERO {
            return Err(DocumentError::LayerProtected(name.to_string()));
        }
        self.layers
            .shift_remove(&table_key(name))
            .ok_or_else(|| DocumentError::UnknownLayer(name.to_string()))
    }

    // ---- 线型与文字样式 ----

    #[inline]
    pub fn has_linetype(&self, name: &str) -> bool {
        self.linetypes.contains_key(&table_key(name))
    }

    #[inline]
    pub fn linetype(&self, name: &str) -> Option<&LineType> {
        self.linetypes.get(&table_key(name))
    }

    #[inline]
    pub fn linetypes(&self) -> impl Iterator<Item = &LineType> {
        self.linetypes.values()
    }

    pub fn add_linetype(&mut self, linetype: LineType) -> Result<(), DocumentError> {
        validate_table_name("linetype", &linetype.name)?;
        self.linetypes.insert(table_key(&linetype.name), linetype);
        Ok(())
    }

    #[inline]
    pub fn has_text_style(&self, name: &str) -> bool {
        self.text_styles.contains_key(&table_key(name))
    }

    #[inline]
    pub fn text_style(&self, name: &str) -> Option<&TextStyle> {
        self.text_styles.get(&table_key(name))
    }

    #[inline]
    pub fn text_styles(&self) -> impl Iterator<Item = &TextStyle> {
        self.text_styles.values()
    }

    pub fn add_text_style(&mut self, style: TextStyle) -> Result<(), DocumentError> {
        validate_table_name("text style", &style.name)?;
        self.text_styles.insert(table_key(&style.name), style);
        Ok(())
    }

    // ---- 块定义 ----

    pub fn add_block_definition(&mut self, definition: BlockDefinition) {
        for entity in &definition.entities {
            self.ensure_layer(entity.layer_name());
        }
        self.blocks.insert(table_key(&definition.name), definition);
    }

    #[inline]
    pub fn block(&self, name: &str) -> Option<&BlockDefinition> {
        self.blocks.get(&table_key(name))
    }

    #[inline]
    pub fn has_block(&self, name: &str) -> bool {
        self.blocks.contains_key(&table_key(name))
    }

    #[inline]
    pub fn blocks(&self) -> impl Iterator<Item = &BlockDefinition> {
        self.blocks.values()
    }

    /// 按插入顺序返回全部块名。
    pub fn block_names(&self) -> Vec<String> {
        self.blocks.values().map(|block| block.name.clone()).collect()
    }

    /// 查找仍在引用指定块的位置，返回第一个引用者的描述。
    pub fn find_block_referrer(&self, name: &str) -> Option<String> {
        let key = table_key(name);
        let refers = |entity: &Entity| entity.block_name().is_some_and(|n| table_key(n) == key);
        if self.entities.iter().any(|(_, entity)| refers(entity)) {
            return Some(Space::Model.to_string());
        }
        for sheet in self.sheets.values() {
            if sheet.entities.iter().any(|(_, entity)| refers(entity)) {
                return Some(Space::Sheet(sheet.name.clone()).to_string());
            }
        }
        self.blocks
            .iter()
            .filter(|(other, _)| **other != key)
            .find(|(_, block)| block.entities.iter().any(refers))
            .map(|(_, block)| format!("block {}", block.name))
    }

    /// 安全删除块定义：仍被引用或属于布局容器时返回错误。
    pub fn delete_block(&mut self, name: &str) -> Result<BlockDefinition, DocumentError> {
        let upper = table_key(name);
        if upper.starts_with("*MODEL_SPACE") || upper.starts_with("*PAPER_SPACE") {
            return Err(DocumentError::BlockProtected(name.to_string()));
        }
        if !self.blocks.contains_key(&upper) {
            return Err(DocumentError::UnknownBlock(name.to_string()));
        }
        if let Some(referenced_by) = self.find_block_referrer(name) {
            return Err(DocumentError::BlockInUse {
                name: name.to_string(),
                referenced_by,
            });
        }
        self.blocks
            .shift_remove(&upper)
            .ok_or_else(|| DocumentError::UnknownBlock(name.to_string()))
    }

    /// 将块参照展开为世界坐标下的实体列表（不修改文档）。
    /// 属性值（ATTRIB）转换为单行文字。
    pub fn explode_reference(
        &self,
        reference: &BlockReference,
    ) -> Result<Vec<Entity>, DocumentError> {
        let block = self
            .block(&reference.name)
            .ok_or_else(|| DocumentError::UnknownBlock(reference.name.clone()))?;
        let transform = InsertTransform::new(reference, block.base_point);
        let mut exploded = Vec::with_capacity(block.entities.len() + reference.attributes.len());
        for entity in &block.entities {
            let mut placed = transform.apply(entity)?;
            placed.attributes_mut().inherit_from(&reference.attrs);
            exploded.push(placed);
        }
        for attribute in &reference.attributes {
            let mut attrs = attribute.attrs.clone();
            attrs.inherit_from(&reference.attrs);
            exploded.push(Entity::Text(Text {
                insert: attribute.insert,
                content: attribute.text.clone(),
                height: attribute.height,
                rotation: attribute.rotation,
                style: attribute.style.clone(),
                attrs,
            }));
        }
        Ok(exploded)
    }

    // ---- 光栅图像定义 ----

    pub fn add_image_definition(&mut self, definition: RasterImageDefinition) {
        if let Ok(value) = u64::from_str_radix(&definition.handle, 16) {
            self.next_handle = self.next_handle.max(value + 1);
        }
        self.image_definitions
            .insert(definition.handle.clone(), definition);
    }

    #[inline]
    pub fn image_definition(&self, handle: &str) -> Option<&RasterImageDefinition> {
        self.image_definitions.get(handle)
    }

    #[inline]
    pub fn image_definitions(&self) -> impl Iterator<Item = &RasterImageDefinition> {
        self.image_definitions.values()
    }

    /// 删除没有任何图像实体（模型空间、图纸、块定义）引用的图像定义，
    /// 按原顺序返回被删除的定义。
    pub fn prune_image_definitions(&mut self) -> Vec<RasterImageDefinition> {
        let referenced: HashSet<String> = self
            .entities
            .iter()
            .chain(self.sheets.values().flat_map(|sheet| sheet.entities.iter()))
            .map(|(_, entity)| entity)
            .chain(self.blocks.values().flat_map(|block| block.entities.iter()))
            .filter_map(|entity| match entity {
                Entity::RasterImage(image) => Some(image.image_def_handle.clone()),
                _ => None,
            })
            .collect();
        let mut removed = Vec::new();
        self.image_definitions.retain(|handle, definition| {
            let keep = referenced.contains(handle);
            if !keep {
                removed.push(definition.clone());
            }
            keep
        });
        removed
    }

    /// 分配一个尚未使用的十六进制句柄。
    pub fn allocate_handle(&mut self) -> String {
        // 低位句柄留给表与段头
        let mut value = self.next_handle.max(0x100);
        while self.image_definitions.contains_key(&format!("{value:X}")) {
            value += 1;
        }
        self.next_handle = value + 1;
        format!("{value:X}")
    }

    // ---- 空间与实体 ----

    pub fn add_sheet(&mut self, name: impl Into<String>) -> Result<(), DocumentError> {
        let name = name.into();
        validate_table_name("sheet", &name)?;
        let key = table_key(&name);
        if self.sheets.contains_key(&key) {
            return Err(DocumentError::DuplicateSheet(name));
        }
        self.sheets.insert(
            key,
            Sheet {
                name,
                entities: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn sheet_names(&self) -> impl Iterator<Item = &str> {
        self.sheets.values().map(|sheet| sheet.name.as_str())
    }

    pub fn has_space(&self, space: &Space) -> bool {
        match space {
            Space::Model => true,
            Space::Sheet(name) => self.sheets.contains_key(&table_key(name)),
        }
    }

    pub fn space_entities(&self, space: &Space) -> Result<&[(EntityId, Entity)], DocumentError> {
        match space {
            Space::Model => Ok(&self.entities),
            Space::Sheet(name) => self
                .sheets
                .get(&table_key(name))
                .map(|sheet| sheet.entities.as_slice())
                .ok_or_else(|| DocumentError::UnknownSheet(name.clone())),
        }
    }

    fn space_entities_mut(
        &mut self,
        space: &Space,
    ) -> Result<&mut Vec<(EntityId, Entity)>, DocumentError> {
        match space {
            Space::Model => Ok(&mut self.entities),
            Space::Sheet(name) => self
                .sheets
                .get_mut(&table_key(name))
                .map(|sheet| &mut sheet.entities)
                .ok_or_else(|| DocumentError::UnknownSheet(name.clone())),
        }
    }

    /// 模型空间实体。
    #[inline]
    pub fn entities(&self) -> impl Iterator<Item = &(EntityId, Entity)> {
        self.entities.iter()
    }

    /// 模型空间实体的可变迭代。
    #[inline]
    pub fn entities_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.iter_mut().map(|(_, entity)| entity)
    }

    #[inline]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities
            .iter()
            .find_map(|(entity_id, entity)| (*entity_id == id).then_some(entity))
    }

    /// 向模型空间追加实体，自动补齐缺失图层。
    pub fn add_entity(&mut self, entity: Entity) -> EntityId {
        self.ensure_layer(entity.layer_name());
        let id = self.next_id();
        self.entities.push((id, entity));
        id
    }

    pub fn add_entity_to(&mut self, space: &Space, entity: Entity) -> Result<EntityId, DocumentError> {
        if let Space::Sheet(name) = space {
            if !self.has_space(space) {
                return Err(DocumentError::UnknownSheet(name.clone()));
            }
        }
        self.ensure_layer(entity.layer_name());
        let id = self.next_id();
        self.space_entities_mut(space)?.push((id, entity));
        Ok(id)
    }

    pub fn remove_entity(&mut self, space: &Space, id: EntityId) -> Option<Entity> {
        let entities = self.space_entities_mut(space).ok()?;
        let index = entities.iter().position(|(entity_id, _)| *entity_id == id)?;
        Some(entities.remove(index).1)
    }

    /// 删除满足条件的实体并按原顺序返回被删除的实体。
    pub fn remove_entities_where<F>(
        &mut self,
        space: &Space,
        mut predicate: F,
    ) -> Result<Vec<(EntityId, Entity)>, DocumentError>
    where
        F: FnMut(&Entity) -> bool,
    {
        let entities = self.space_entities_mut(space)?;
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(entities.len());
        for (id, entity) in entities.drain(..) {
            if predicate(&entity) {
                removed.push((id, entity));
            } else {
                kept.push((id, entity));
            }
        }
        *entities = kept;
        Ok(removed)
    }

    pub fn add_line(&mut self, start: Point2, end: Point2, layer: impl Into<String>) -> EntityId {
        self.add_entity(Entity::Line(Line {
            start,
            end,
            attrs: EntityAttributes::on_layer(layer),
        }))
    }

    pub fn add_circle(&mut self, center: Point2, radius: f64, layer: impl Into<String>) -> EntityId {
        self.add_entity(Entity::Circle(Circle {
            center,
            radius,
            attrs: EntityAttributes::on_layer(layer),
        }))
    }

    pub fn add_polyline<I>(&mut self, vertices: I, is_closed: bool, layer: impl Into<String>) -> EntityId
    where
        I: IntoIterator<Item = Point2>,
    {
        self.add_entity(Entity::Polyline(Polyline {
            vertices: vertices.into_iter().map(PolylineVertex::new).collect(),
            is_closed,
            attrs: EntityAttributes::on_layer(layer),
        }))
    }

    pub fn add_text(
        &mut self,
        insert: Point2,
        content: impl Into<String>,
        height: f64,
        layer: impl Into<String>,
    ) -> EntityId {
        self.add_entity(Entity::Text(Text {
            insert,
            content: content.into(),
            height,
            rotation: 0.0,
            style: None,
            attrs: EntityAttributes::on_layer(layer),
        }))
    }

    pub fn add_block_reference(
        &mut self,
        name: impl Into<String>,
        insert: Point2,
        layer: impl Into<String>,
    ) -> EntityId {
        self.add_entity(Entity::BlockReference(BlockReference {
            name: name.into(),
            insert,
            scale: Vector2::new(1.0, 1.0),
            rotation: 0.0,
            attributes: Vec::new(),
            attrs: EntityAttributes::on_layer(layer),
        }))
    }

    #[inline]
    fn next_id(&mut self) -> EntityId {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        EntityId(id)
    }
}
