#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "classdb_it_{}_{}_{}",
        std::process::id(),
        nanos,
        name
    ))
}

pub fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> anyhow::Result<()> {
    use std::io::Write;
    use zip::write::FileOptions;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, content) in entries {
        zip.start_file(*name, options)?;
        zip.write_all(content)?;
    }
    zip.finish()?;
    Ok(())
}

/// Writes a jar from built classes, naming each entry after its class.
pub fn write_class_jar(path: &Path, classes: &[ClassBuilder]) -> anyhow::Result<()> {
    let built: Vec<(String, Vec<u8>)> = classes
        .iter()
        .map(|c| (c.entry_name(), c.build()))
        .collect();
    let entries: Vec<(&str, &[u8])> = built
        .iter()
        .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
        .collect();
    write_jar(path, &entries)
}

pub fn remove_db(path: &Path) {
    let _ = std::fs::remove_file(path);
    let mut lock = path.as_os_str().to_os_string();
    lock.push("-lock");
    let _ = std::fs::remove_file(PathBuf::from(lock));
}

#[derive(Debug, Clone, Copy)]
pub enum Op {
    GetField,
    GetStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeInterface,
}

#[derive(Debug, Clone)]
pub struct Call {
    op: Op,
    owner: String,
    name: String,
    descriptor: String,
}

impl Call {
    pub fn new(op: Op, owner: &str, name: &str, descriptor: &str) -> Self {
        Self {
            op,
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct MethodSpec {
    name: String,
    descriptor: String,
    calls: Vec<Call>,
}

/// Minimal class-file writer (major version 52) for test fixtures.
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    name: String,
    super_class: Option<String>,
    interfaces: Vec<String>,
    access: u16,
    fields: Vec<(String, String)>,
    methods: Vec<MethodSpec>,
    annotations: Vec<String>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            super_class: Some("java.lang.Object".to_string()),
            interfaces: Vec::new(),
            access: 0x0021,
            fields: Vec::new(),
            methods: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn extends(mut self, parent: &str) -> Self {
        self.super_class = Some(parent.to_string());
        self
    }

    pub fn implements(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.to_string());
        self
    }

    pub fn interface(mut self) -> Self {
        self.access = 0x0601;
        self
    }

    pub fn field(mut self, name: &str, descriptor: &str) -> Self {
        self.fields.push((name.to_string(), descriptor.to_string()));
        self
    }

    pub fn method(mut self, name: &str, descriptor: &str, calls: &[Call]) -> Self {
        self.methods.push(MethodSpec {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            calls: calls.to_vec(),
        });
        self
    }

    pub fn annotation(mut self, fqn: &str) -> Self {
        self.annotations.push(fqn.to_string());
        self
    }

    pub fn entry_name(&self) -> String {
        format!("{}.class", self.name.replace('.', "/"))
    }

    pub fn build(&self) -> Vec<u8> {
        let mut pool = Pool::default();
        let mut body = Vec::new();

        put_u2(&mut body, self.access);
        put_u2(&mut body, pool.class(&self.name));
        let super_index = match &self.super_class {
            Some(parent) => pool.class(parent),
            None => 0,
        };
        put_u2(&mut body, super_index);

        put_u2(&mut body, self.interfaces.len() as u16);
        for interface in &self.interfaces {
            put_u2(&mut body, pool.class(interface));
        }

        put_u2(&mut body, self.fields.len() as u16);
        for (name, descriptor) in &self.fields {
            put_u2(&mut body, 0x0001);
            put_u2(&mut body, pool.utf8(name));
            put_u2(&mut body, pool.utf8(descriptor));
            put_u2(&mut body, 0);
        }

        put_u2(&mut body, self.methods.len() as u16);
        for method in &self.methods {
            put_u2(&mut body, 0x0001);
            put_u2(&mut body, pool.utf8(&method.name));
            put_u2(&mut body, pool.utf8(&method.descriptor));
            put_u2(&mut body, 1);

            let mut code = Vec::new();
            for call in &method.calls {
                let (opcode, tag) = match call.op {
                    Op::GetField => (0xb4, 9),
                    Op::GetStatic => (0xb2, 9),
                    Op::InvokeVirtual => (0xb6, 10),
                    Op::InvokeStatic => (0xb8, 10),
                    Op::InvokeInterface => (0xb9, 11),
                };
                code.push(opcode);
                put_u2(
                    &mut code,
                    pool.member(tag, &call.owner, &call.name, &call.descriptor),
                );
                if matches!(call.op, Op::InvokeInterface) {
                    code.extend_from_slice(&[1, 0]);
                }
            }
            code.push(0xb1);

            let mut attribute = Vec::new();
            put_u2(&mut attribute, 4);
            put_u2(&mut attribute, 4);
            put_u4(&mut attribute, code.len() as u32);
            attribute.extend_from_slice(&code);
            put_u2(&mut attribute, 0);
            put_u2(&mut attribute, 0);

            put_u2(&mut body, pool.utf8("Code"));
            put_u4(&mut body, attribute.len() as u32);
            body.extend_from_slice(&attribute);
        }

        if self.annotations.is_empty() {
            put_u2(&mut body, 0);
        } else {
            put_u2(&mut body, 1);
            let mut attribute = Vec::new();
            put_u2(&mut attribute, self.annotations.len() as u16);
            for annotation in &self.annotations {
                let descriptor = format!("L{};", annotation.replace('.', "/"));
                put_u2(&mut attribute, pool.utf8(&descriptor));
                put_u2(&mut attribute, 0);
            }
            put_u2(&mut body, pool.utf8("RuntimeVisibleAnnotations"));
            put_u4(&mut body, attribute.len() as u32);
            body.extend_from_slice(&attribute);
        }

        let mut out = Vec::new();
        put_u4(&mut out, 0xCAFE_BABE);
        put_u2(&mut out, 0);
        put_u2(&mut out, 52);
        put_u2(&mut out, pool.count + 1);
        out.extend_from_slice(&pool.bytes);
        out.extend_from_slice(&body);
        out
    }
}

#[derive(Default)]
struct Pool {
    bytes: Vec<u8>,
    count: u16,
    index: HashMap<String, u16>,
}

impl Pool {
    fn intern(&mut self, key: String, encoded: Vec<u8>) -> u16 {
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        self.count += 1;
        self.bytes.extend_from_slice(&encoded);
        self.index.insert(key, self.count);
        self.count
    }

    fn utf8(&mut self, value: &str) -> u16 {
        let mut encoded = vec![1];
        put_u2(&mut encoded, value.len() as u16);
        encoded.extend_from_slice(value.as_bytes());
        self.intern(format!("utf8:{value}"), encoded)
    }

    fn class(&mut self, fqn: &str) -> u16 {
        let name = self.utf8(&fqn.replace('.', "/"));
        let mut encoded = vec![7];
        put_u2(&mut encoded, name);
        self.intern(format!("class:{fqn}"), encoded)
    }

    fn member(&mut self, tag: u8, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class = self.class(owner);
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut nat = vec![12];
        put_u2(&mut nat, name_index);
        put_u2(&mut nat, descriptor_index);
        let nat_index = self.intern(format!("nat:{name}:{descriptor}"), nat);

        let mut encoded = vec![tag];
        put_u2(&mut encoded, class);
        put_u2(&mut encoded, nat_index);
        self.intern(format!("member:{tag}:{owner}:{name}:{descriptor}"), encoded)
    }
}

fn put_u2(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_u4(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}
