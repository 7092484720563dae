//! Recent-allocation ring buffer and its DDM "REAL" report.

use std::collections::HashMap;

use nova_jdwp::{signature_to_class_name, JdwpWriter, MethodId};

use crate::error::{AgentError, AgentResult};
use crate::runtime::{ClassId, ClassModel, ThreadHandle};

const HEADER_LEN: u8 = 15;
const ENTRY_HEADER_LEN: u8 = 9;
const FRAME_LEN: u8 = 8;

const LINE_NATIVE: i16 = -2;
const LINE_UNKNOWN: i16 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocFrame {
    pub method: MethodId,
    pub pc: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub thread: ThreadHandle,
    pub class: ClassId,
    pub size: u32,
    /// Innermost first, at most `max_stack_depth` long.
    pub frames: Vec<AllocFrame>,
}

#[derive(Debug, Default)]
pub struct AllocationTracker {
    records: Vec<AllocationRecord>,
    capacity: usize,
    /// Index of the oldest record once the buffer has wrapped.
    head: usize,
    max_stack_depth: usize,
    enabled: bool,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self, capacity: usize, max_stack_depth: usize) -> AgentResult<()> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(AgentError::IllegalArgument(format!(
                "allocation record capacity {capacity} is not a power of two"
            )));
        }
        let mut records = Vec::new();
        records.try_reserve_exact(capacity).map_err(|err| {
            AgentError::OutOfMemory(format!("allocation record buffer ({capacity} entries): {err}"))
        })?;
        self.records = records;
        self.capacity = capacity;
        self.head = 0;
        self.max_stack_depth = max_stack_depth;
        self.enabled = true;
        tracing::info!(target = "nova.jdwp", capacity, max_stack_depth, "allocation tracking enabled");
        Ok(())
    }

    pub fn disable(&mut self) {
        self.records = Vec::new();
        self.capacity = 0;
        self.head = 0;
        if self.enabled {
            tracing::info!(target = "nova.jdwp", "allocation tracking disabled");
        }
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record one allocation; frames beyond the depth limit are left out.
    pub fn record(
        &mut self,
        thread: ThreadHandle,
        class: ClassId,
        size: u32,
        frames: impl IntoIterator<Item = AllocFrame>,
    ) {
        if !self.enabled {
            return;
        }
        let record = AllocationRecord {
            thread,
            class,
            size,
            frames: frames.into_iter().take(self.max_stack_depth).collect(),
        };
        if self.records.len() < self.capacity {
            self.records.push(record);
        } else {
            self.records[self.head] = record;
            self.head = (self.head + 1) & (self.capacity - 1);
        }
    }

    /// Records from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &AllocationRecord> {
        let (newer, older) = self.records.split_at(self.head);
        older.iter().chain(newer)
    }

    /// Encode the buffer as a DDM "REAL" chunk body.
    pub fn snapshot(&self, classes: &dyn ClassModel) -> Vec<u8> {
        let mut class_names = StringTable::default();
        let mut method_names = StringTable::default();
        let mut file_names = StringTable::default();

        let mut body = JdwpWriter::new();
        let count = self.len().min(u16::MAX as usize);
        for record in self.iter().take(count) {
            let class_idx = class_names.intern(class_name(classes, record.class));
            body.write_u32(record.size);
            body.write_u16(u16::try_from(record.thread.0).unwrap_or(u16::MAX));
            body.write_u16(class_idx);
            body.write_u8(record.frames.len().min(u8::MAX as usize) as u8);
            for frame in record.frames.iter().take(u8::MAX as usize) {
                let method = classes.method(frame.method);
                let (owner, name, line, file) = match &method {
                    Some(method) => {
                        let class = classes.class(method.owner);
                        let line = if method.is_native() {
                            LINE_NATIVE
                        } else {
                            method
                                .line_for_pc(frame.pc)
                                .map(|line| line.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
                                .unwrap_or(LINE_UNKNOWN)
                        };
                        (
                            class_name(classes, method.owner),
                            method.name.clone(),
                            line,
                            class.and_then(|class| class.source_file).unwrap_or_default(),
                        )
                    }
                    None => (String::new(), String::new(), LINE_UNKNOWN, String::new()),
                };
                body.write_u16(class_names.intern(owner));
                body.write_u16(method_names.intern(name));
                body.write_u16(file_names.intern(file));
                body.write_i16(line);
            }
        }

        let mut out = JdwpWriter::new();
        out.write_u8(HEADER_LEN);
        out.write_u8(ENTRY_HEADER_LEN);
        out.write_u8(FRAME_LEN);
        out.write_u16(u16::try_from(count).unwrap_or(u16::MAX));
        let offset_at = out.len();
        out.write_u32(0);
        out.write_u16(class_names.len());
        out.write_u16(method_names.len());
        out.write_u16(file_names.len());
        out.write_bytes(&body.into_vec());
        let string_table_offset = out.len() as u32;
        out.patch_u32(offset_at, string_table_offset);
        for table in [class_names, method_names, file_names] {
            for name in table.names {
                out.write_utf16_string(&name);
            }
        }
        out.into_vec()
    }
}

fn class_name(classes: &dyn ClassModel, class: ClassId) -> String {
    classes
        .class(class)
        .map(|info| signature_to_class_name(&info.signature))
        .unwrap_or_default()
}

/// Stands in for every name past what a table's `u16` count can hold.
const OVERFLOW_NAME: &str = "<more>";

#[derive(Default)]
struct StringTable {
    names: Vec<String>,
    index: HashMap<String, u16>,
}

impl StringTable {
    fn intern(&mut self, name: String) -> u16 {
        if let Some(idx) = self.index.get(&name) {
            return *idx;
        }
        // The last slot is kept for the overflow entry.
        let name = if self.names.len() + 1 < usize::from(u16::MAX) {
            name
        } else {
            OVERFLOW_NAME.to_owned()
        };
        if let Some(idx) = self.index.get(&name) {
            return *idx;
        }
        let idx = u16::try_from(self.names.len()).unwrap_or(u16::MAX);
        self.index.insert(name.clone(), idx);
        self.names.push(name);
        idx
    }

    fn len(&self) -> u16 {
        u16::try_from(self.names.len()).unwrap_or(u16::MAX)
    }
}

#[cfg(test)]
mod tests {
    use nova_jdwp::{JdwpReader, ACC_NATIVE};

    use super::*;
    use crate::mock::MockRuntime;

    fn read_utf16(reader: &mut JdwpReader<'_>) -> String {
        let len = reader.read_u32().unwrap() as usize;
        let units: Vec<u16> = (0..len).map(|_| reader.read_u16().unwrap()).collect();
        String::from_utf16(&units).unwrap()
    }

    #[test]
    fn enable_rejects_non_power_of_two_capacity() {
        let mut tracker = AllocationTracker::new();
        assert!(matches!(
            tracker.enable(6, 4),
            Err(AgentError::IllegalArgument(_))
        ));
        assert!(!tracker.is_enabled());
        tracker.record(ThreadHandle(1), 1, 8, []);
        assert!(tracker.is_empty());
    }

    #[test]
    fn ring_keeps_the_newest_records_oldest_first() {
        let mut tracker = AllocationTracker::new();
        tracker.enable(4, 2).unwrap();
        for size in 1..=6 {
            tracker.record(
                ThreadHandle(1),
                7,
                size,
                (0..5).map(|pc| AllocFrame { method: 1, pc }),
            );
        }
        let sizes: Vec<u32> = tracker.iter().map(|r| r.size).collect();
        assert_eq!(sizes, vec![3, 4, 5, 6]);
        assert!(tracker.iter().all(|r| r.frames.len() == 2));

        tracker.disable();
        assert_eq!(tracker.capacity(), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn snapshot_deduplicates_string_tables() {
        let mock = MockRuntime::new();
        let string = mock.add_class("Ljava/lang/String;");
        let main = mock.add_class("Lcom/example/Main;");
        mock.set_source_file(main, "Main.java");
        let run = mock.add_method(main, "run", "()V", 0, 10, &[(0, 3), (5, 4)]);
        let native = mock.add_method(main, "alloc0", "()V", ACC_NATIVE, 0, &[]);

        let mut tracker = AllocationTracker::new();
        tracker.enable(4, 8).unwrap();
        for size in 0..6u32 {
            tracker.record(
                ThreadHandle(2),
                string,
                16 + size,
                [
                    AllocFrame { method: native, pc: 0 },
                    AllocFrame { method: run, pc: 6 },
                ],
            );
        }

        let bytes = tracker.snapshot(&mock);
        let mut r = JdwpReader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 15);
        assert_eq!(r.read_u8().unwrap(), 9);
        assert_eq!(r.read_u8().unwrap(), 8);
        assert_eq!(r.read_u16().unwrap(), 4);
        let table_offset = r.read_u32().unwrap() as usize;
        let class_count = r.read_u16().unwrap();
        let method_count = r.read_u16().unwrap();
        let file_count = r.read_u16().unwrap();
        assert_eq!((class_count, method_count, file_count), (2, 2, 1));

        let mut sizes = Vec::new();
        for _ in 0..4 {
            sizes.push(r.read_u32().unwrap());
            assert_eq!(r.read_u16().unwrap(), 2);
            assert_eq!(r.read_u16().unwrap(), 0);
            assert_eq!(r.read_u8().unwrap(), 2);
            // native frame
            assert_eq!(r.read_u16().unwrap(), 1);
            assert_eq!(r.read_u16().unwrap(), 0);
            assert_eq!(r.read_u16().unwrap(), 0);
            assert_eq!(r.read_i16().unwrap(), -2);
            // run() at line 4
            assert_eq!(r.read_u16().unwrap(), 1);
            assert_eq!(r.read_u16().unwrap(), 1);
            assert_eq!(r.read_u16().unwrap(), 0);
            assert_eq!(r.read_i16().unwrap(), 4);
        }
        assert_eq!(sizes, vec![18, 19, 20, 21]);
        assert_eq!(bytes.len() - r.remaining(), table_offset);

        let classes: Vec<_> = (0..class_count).map(|_| read_utf16(&mut r)).collect();
        let methods: Vec<_> = (0..method_count).map(|_| read_utf16(&mut r)).collect();
        let files: Vec<_> = (0..file_count).map(|_| read_utf16(&mut r)).collect();
        assert_eq!(classes, vec!["java.lang.String", "com.example.Main"]);
        assert_eq!(methods, vec!["alloc0", "run"]);
        assert_eq!(files, vec!["Main.java"]);
        assert!(r.is_empty());
    }

    #[test]
    fn string_tables_saturate_at_the_u16_limit() {
        let mut table = StringTable::default();
        let first = table.intern("java.lang.Object".to_owned());
        for n in 0..70_000 {
            table.intern(format!("com.example.Gen{n}"));
        }
        assert_eq!(table.len(), u16::MAX);
        let overflow = table.intern("com.example.Late".to_owned());
        assert_eq!(overflow, u16::MAX - 1);
        assert_eq!(table.names[usize::from(overflow)], OVERFLOW_NAME);
        assert_eq!(table.intern("java.lang.Object".to_owned()), first);
    }
}
