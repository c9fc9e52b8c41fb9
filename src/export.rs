// Copyright (C) 2024, Tony Rippy
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use driver::{Exporter, Report};
use serde::Serialize;
use serde_json::ser::PrettyFormatter;

/// Indented JSON with a trailing newline.
fn render<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b" "));
    value.serialize(&mut serializer)?;
    out.push(b'\n');
    Ok(out)
}

fn partitions_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{}partitions.json", prefix))
}

fn brokers_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{}brokers.json", prefix))
}

/// Replaces `path` in one step so readers never see a partial file.
fn write_atomically(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

pub struct FileExporter {
    prefix: String,
}

impl FileExporter {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }
}

impl Exporter for FileExporter {
    fn export(&mut self, report: &Report) -> io::Result<()> {
        let partitions = partitions_path(&self.prefix);
        write_atomically(&partitions, &render(&report.partitions)?)?;
        let brokers = brokers_path(&self.prefix);
        write_atomically(&brokers, &render(&report.brokers)?)?;
        info!("broker free space written to {}", brokers.display());
        info!("partition sizes written to {}", partitions.display());
        Ok(())
    }
}

/// Shows what would have been written.
pub struct DryRunExporter<W: Write> {
    prefix: String,
    out: W,
}

impl<W: Write> DryRunExporter<W> {
    pub fn new(prefix: &str, out: W) -> Self {
        Self {
            prefix: prefix.to_string(),
            out,
        }
    }
}

impl<W: Write> Exporter for DryRunExporter<W> {
    fn export(&mut self, report: &Report) -> io::Result<()> {
        let brokers = brokers_path(&self.prefix);
        writeln!(self.out, "Broker data would be written to {}:", brokers.display())?;
        self.out.write_all(&render(&report.brokers)?)?;
        let partitions = partitions_path(&self.prefix);
        writeln!(
            self.out,
            "Partition data would be written to {}:",
            partitions.display()
        )?;
        self.out.write_all(&render(&report.partitions)?)?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver::collect::{NodeMetrics, PartitionMetrics};
    use std::collections::BTreeMap;

    fn report() -> Report {
        let mut partitions = PartitionMetrics::new();
        partitions.entry("orders".to_string()).or_default().insert(
            "3".to_string(),
            BTreeMap::from([("Size".to_string(), 1024.0)]),
        );
        let brokers = NodeMetrics::from([(
            "1".to_string(),
            BTreeMap::from([("StorageFree".to_string(), 5000000000.0)]),
        )]);
        Report {
            partitions,
            brokers,
        }
    }

    #[test]
    fn writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/flixfetcher.", dir.path().display());
        let report = report();

        FileExporter::new(&prefix).export(&report).unwrap();

        let partitions = fs::read_to_string(dir.path().join("flixfetcher.partitions.json")).unwrap();
        assert_eq!(
            partitions,
            "{\n \"orders\": {\n  \"3\": {\n   \"Size\": 1024.0\n  }\n }\n}\n"
        );
        let back: PartitionMetrics = serde_json::from_str(&partitions).unwrap();
        assert_eq!(back, report.partitions);

        let brokers = fs::read_to_string(dir.path().join("flixfetcher.brokers.json")).unwrap();
        let back: NodeMetrics = serde_json::from_str(&brokers).unwrap();
        assert_eq!(back, report.brokers);

        assert!(!dir.path().join("flixfetcher.brokers.json.tmp").exists());
    }

    #[test]
    fn empty_report_writes_empty_objects() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/x-", dir.path().display());

        FileExporter::new(&prefix).export(&Report::default()).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("x-partitions.json")).unwrap(), "{}\n");
        assert_eq!(fs::read_to_string(dir.path().join("x-brokers.json")).unwrap(), "{}\n");
    }

    #[test]
    fn dry_run_prints_instead_of_writing() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/flixfetcher.", dir.path().display());
        let mut out = Vec::new();

        DryRunExporter::new(&prefix, &mut out).export(&report()).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("flixfetcher.brokers.json:\n{\n \"1\": {\n  \"StorageFree\": 5000000000.0"));
        assert!(text.contains("flixfetcher.partitions.json:\n{\n \"orders\""));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
