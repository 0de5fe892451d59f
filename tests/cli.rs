mod common;

use common::{Call, ClassBuilder, Op, temp_dir, write_class_jar};
use std::path::Path;
use std::process::Command;

fn classdb(db: &Path, args: &[&str]) -> anyhow::Result<(bool, String)> {
    let output = Command::new(env!("CARGO_BIN_EXE_classdb"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env("CLASSDB_LOG", "off")
        .output()?;
    Ok((output.status.success(), String::from_utf8(output.stdout)?))
}

#[test]
fn load_find_usages_stats_and_clear() -> anyhow::Result<()> {
    let base = temp_dir("cli");
    let db = base.join("db.lmdb");
    let jar = base.join("app.jar");
    write_class_jar(
        &jar,
        &[
            ClassBuilder::new("app.Main").method(
                "main",
                "([Ljava/lang/String;)V",
                &[Call::new(Op::InvokeStatic, "app.Util", "help", "()V")],
            ),
            ClassBuilder::new("app.Util").method("help", "()V", &[]),
            ClassBuilder::new("app.Special").extends("app.Util"),
        ],
    )?;
    let jar_arg = jar.to_string_lossy().to_string();

    let (ok, out) = classdb(&db, &["load", &jar_arg])?;
    assert!(ok);
    let report: serde_json::Value = serde_json::from_str(&out)?;
    assert_eq!(report["libraries"][0]["status"], "committed");
    assert_eq!(report["libraries"][0]["classes"], 3);

    let (ok, out) = classdb(&db, &["find", "app/Special"])?;
    assert!(ok);
    let class: serde_json::Value = serde_json::from_str(&out)?;
    assert_eq!(class["name"], "app.Special");
    assert_eq!(class["super_class"], "app.Util");

    let (ok, out) = classdb(&db, &["subclasses", "app.Util"])?;
    assert!(ok);
    let names: Vec<String> = serde_json::from_str(&out)?;
    assert_eq!(names, ["app.Special".to_string()]);

    let (ok, out) = classdb(&db, &["usages", "app.Util", "help"])?;
    assert!(ok);
    let usages: serde_json::Value = serde_json::from_str(&out)?;
    assert_eq!(usages[0]["class"], "app.Main");
    assert_eq!(usages[0]["method"], "main");

    let (ok, out) = classdb(&db, &["refresh"])?;
    assert!(ok);
    let report: serde_json::Value = serde_json::from_str(&out)?;
    assert_eq!(report["libraries"][0]["status"], "unchanged");

    let (ok, out) = classdb(&db, &["stats"])?;
    assert!(ok);
    let stats: serde_json::Value = serde_json::from_str(&out)?;
    assert_eq!(stats["registered_libraries"], 1);
    assert_eq!(stats["persistence"]["class_records"], 3);

    let (ok, _) = classdb(&db, &["find", "app.Missing"])?;
    assert!(!ok);

    let (ok, _) = classdb(&db, &["clear"])?;
    assert!(ok);
    assert!(!db.exists());

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}
