use std::fs;
use std::path::Path;

use dxfnorm_batch::{BatchRunner, BatchSettings, FileStatus, SheetStatus};
use dxfnorm_core::document::{BlockDefinition, Document, Entity, EntityAttributes, Line, Space};
use dxfnorm_core::geometry::Point2;
use dxfnorm_engine::pipeline::PipelineOptions;
use dxfnorm_io::{DocumentLoader, DocumentSaver, DxfFacade};
use tempfile::tempdir;

fn save(document: &Document, path: &Path) {
    DxfFacade::new().save(document, path).expect("写出测试图纸失败");
}

fn load(path: &Path) -> Document {
    DxfFacade::new().load(path).expect("读取输出图纸失败")
}

fn drawing() -> Document {
    let mut doc = Document::new();
    let mut frame = BlockDefinition::new("FRAME");
    frame.entities.push(Entity::Line(Line {
        start: Point2::new(0.0, 0.0),
        end: Point2::new(100.0, 0.0),
        attrs: EntityAttributes::on_layer("0"),
    }));
    doc.add_block_definition(frame);
    doc.add_block_reference("FRAME", Point2::new(0.0, 0.0), "WALLS");
    doc.add_polyline(
        [
            Point2::new(0.0, 0.0),
            Point2::new(12.0, 0.0),
            Point2::new(12.0, 12.0),
            Point2::new(0.0, 12.0),
        ],
        true,
        "REV",
    );
    doc
}

fn logo() -> Document {
    let mut logo = Document::new();
    logo.add_text(Point2::new(1.0, 1.0), "ACME", 2.5, "LOGO");
    logo
}

fn settings(root: &Path) -> BatchSettings {
    BatchSettings {
        input_dir: root.join("in"),
        output_dir: root.join("out"),
        logo_file: Some(root.join("logo.dxf")),
        remap_table: Some(root.join("layers.toml")),
        options: PipelineOptions {
            cloud_layers: vec!["REV".to_string()],
            ..PipelineOptions::default()
        },
    }
}

fn prepare(root: &Path) {
    fs::create_dir_all(root.join("in")).unwrap();
    save(&logo(), &root.join("logo.dxf"));
    fs::write(
        root.join("layers.toml"),
        "[[rows]]\ncurrentLayer = \"WALLS\"\nnewLayer = \"A-WALL\"\ncolorID = 1\nlineweight = 0.5\n",
    )
    .unwrap();
}

#[test]
fn drawings_are_normalized_and_written() {
    let dir = tempdir().unwrap();
    prepare(dir.path());
    save(&drawing(), &dir.path().join("in/plan_1.dxf"));
    save(&drawing(), &dir.path().join("in/plan_2.DXF"));
    fs::write(dir.path().join("in/readme.txt"), "skip me").unwrap();

    let report = BatchRunner::new().run(&settings(dir.path())).unwrap();
    assert_eq!(report.files.len(), 2);
    assert_eq!(report.succeeded().count(), 2);

    let output = dir.path().join("out/plan_1.dxf");
    assert_eq!(report.outputs()[0], output);
    let doc = load(&output);

    let wall = doc.layer("A-WALL").expect("映射后的图层缺失");
    assert_eq!(wall.color, 1);
    assert_eq!(wall.lineweight, 5);
    assert!(!doc.has_layer("WALLS"));
    assert!(doc.block_names().is_empty());

    let kinds: Vec<&str> = doc.entities().map(|(_, entity)| entity.kind_name()).collect();
    assert_eq!(kinds, vec!["LINE", "TEXT", "REVCLOUD"]);
    for (_, entity) in doc.entities() {
        assert!(entity.attributes().is_bylayer());
    }
    let layers: Vec<&str> = doc.entities().map(|(_, entity)| entity.layer_name()).collect();
    assert_eq!(layers, vec!["A-WALL", "LOGO", "REV"]);
}

#[test]
fn unreadable_file_is_skipped_and_batch_continues() {
    let dir = tempdir().unwrap();
    prepare(dir.path());
    fs::write(dir.path().join("in/a_broken.dxf"), "not a drawing").unwrap();
    save(&drawing(), &dir.path().join("in/b_good.dxf"));

    let report = BatchRunner::new().run(&settings(dir.path())).unwrap();
    assert_eq!(report.files.len(), 2);
    let failed: Vec<String> = report
        .failed()
        .map(|(outcome, _)| outcome.file_name())
        .collect();
    assert_eq!(failed, vec!["a_broken.dxf"]);
    assert!(matches!(report.files[1].status, FileStatus::Normalized { .. }));
    assert!(!dir.path().join("out/a_broken.dxf").exists());
    assert!(dir.path().join("out/b_good.dxf").exists());
}

#[test]
fn missing_logo_fails_every_document() {
    let dir = tempdir().unwrap();
    prepare(dir.path());
    fs::remove_file(dir.path().join("logo.dxf")).unwrap();
    save(&drawing(), &dir.path().join("in/one.dxf"));
    save(&drawing(), &dir.path().join("in/two.dxf"));

    let report = BatchRunner::new().run(&settings(dir.path())).unwrap();
    let reasons: Vec<&str> = report.failed().map(|(_, reason)| reason).collect();
    assert_eq!(reasons.len(), 2);
    assert_eq!(reasons[0], reasons[1]);
    assert!(reasons[0].contains("标志文档不可用"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn malformed_row_fails_only_documents_with_its_layer() {
    let dir = tempdir().unwrap();
    prepare(dir.path());
    fs::write(
        dir.path().join("layers.toml"),
        "[[rows]]\ncurrentLayer = \"WALLS\"\ncolorID = \"red\"\n",
    )
    .unwrap();
    save(&drawing(), &dir.path().join("in/with_walls.dxf"));
    let mut plain = Document::new();
    plain.add_line(Point2::new(0.0, 0.0), Point2::new(1.0, 1.0), "NOTES");
    save(&plain, &dir.path().join("in/without_walls.dxf"));

    let report = BatchRunner::new().run(&settings(dir.path())).unwrap();
    let failed: Vec<String> = report
        .failed()
        .map(|(outcome, _)| outcome.file_name())
        .collect();
    assert_eq!(failed, vec!["with_walls.dxf"]);
}

#[test]
fn combined_export_orders_sheets_by_suffix() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("adjusted");
    for name in ["a_2", "a_1", "b"] {
        let mut doc = Document::new();
        doc.add_text(Point2::new(0.0, 0.0), name, 2.5, format!("L-{name}"));
        save(&doc, &input.join(format!("{name}.dxf")));
    }

    let output = dir.path().join("combined.dxf");
    let report = BatchRunner::new().combine_dir(&input, &output).unwrap();
    assert_eq!(report.merged_count(), 3);
    let order: Vec<(String, String)> = report
        .sheets
        .iter()
        .map(|sheet| {
            let file = sheet.input.file_name().unwrap().to_string_lossy().into_owned();
            (sheet.sheet.clone(), file)
        })
        .collect();
    assert_eq!(
        order,
        vec![
            ("FL1".to_string(), "a_1.dxf".to_string()),
            ("FL2".to_string(), "a_2.dxf".to_string()),
            ("FL3".to_string(), "b.dxf".to_string()),
        ]
    );

    let combined = load(&output);
    assert_eq!(combined.sheet_names().collect::<Vec<_>>(), vec!["FL1", "FL2", "FL3"]);
    assert_eq!(combined.entities().count(), 0);
    for (sheet, expected) in [("FL1", "a_1"), ("FL2", "a_2"), ("FL3", "b")] {
        let entities = combined
            .space_entities(&Space::Sheet(sheet.to_string()))
            .unwrap();
        assert_eq!(entities.len(), 1);
        match &entities[0].1 {
            Entity::Text(text) => assert_eq!(text.content, expected),
            other => panic!("{sheet} 中出现意外实体 {other:?}"),
        }
        assert!(combined.has_layer(&format!("L-{expected}")));
    }
}

#[test]
fn unreadable_sheet_source_leaves_its_sheet_empty() {
    let dir = tempdir().unwrap();
    let good = dir.path().join("good_1.dxf");
    let mut doc = Document::new();
    doc.add_line(Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), "0");
    save(&doc, &good);
    let broken = dir.path().join("broken_2.dxf");
    fs::write(&broken, "0\nSECTION\n2").unwrap();

    let output = dir.path().join("combined.dxf");
    let report = BatchRunner::new()
        .combine(vec![broken, good], &output)
        .unwrap();
    assert_eq!(report.merged_count(), 1);
    assert!(matches!(report.sheets[1].status, SheetStatus::Failed { .. }));

    let combined = load(&output);
    let fl2 = combined.space_entities(&Space::Sheet("FL2".to_string())).unwrap();
    assert!(fl2.is_empty());
}
