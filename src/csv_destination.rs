use crate::error::{PipelineError, Result};
use crate::sink::{Destination, FlushError};
use serde::Serialize;
use std::fs::File;
use std::marker::PhantomData;
use std::path::PathBuf;
use tracing::debug;

/// Writes serializable records to a CSV file.
///
/// The file is created on the first flush. Struct records get a header row
/// built from their field names; sequence records (e.g. `Vec<String>`) are
/// written without one.
pub struct CsvDestination<T> {
    name: String,
    path: Option<PathBuf>,
    has_headers: bool,
    writer: Option<csv::Writer<File>>,
    _marker: PhantomData<fn(T)>,
}

impl<T> CsvDestination<T> {
    /// Create a destination without a target file; `with_path` must be called before running
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            has_headers: true,
            writer: None,
            _marker: PhantomData,
        }
    }

    /// Create a destination writing to `path`
    pub fn to_file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(name).with_path(path)
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Enable or disable the header row for struct records
    pub fn with_headers(mut self, has_headers: bool) -> Self {
        self.has_headers = has_headers;
        self
    }

    fn open(&mut self) -> std::result::Result<&mut csv::Writer<File>, FlushError> {
        if self.writer.is_none() {
            let path = self
                .path
                .as_ref()
                .ok_or_else(|| FlushError::batch("no file path configured"))?;
            let writer = csv::WriterBuilder::new()
                .has_headers(self.has_headers)
                .from_path(path)
                .map_err(FlushError::batch)?;
            debug!(node = %self.name, path = %path.display(), "opened csv file");
            self.writer = Some(writer);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| FlushError::batch("csv writer unavailable"))
    }
}

/// Serialize `record` on its own so a failing record never leaves a partial row behind
fn check_serializable<T: Serialize>(record: &T) -> std::result::Result<(), csv::Error> {
    let mut scratch = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    scratch.serialize(record)
}

impl<T: Serialize + Send + 'static> Destination for CsvDestination<T> {
    type Input = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self) -> Result<()> {
        match &self.path {
            Some(path) if !path.as_os_str().is_empty() => Ok(()),
            _ => Err(PipelineError::Setup {
                node: self.name.clone(),
                reason: "no file path configured".into(),
            }),
        }
    }

    fn flush_batch(&mut self, records: &[T]) -> std::result::Result<(), FlushError> {
        let writer = self.open()?;
        for (index, record) in records.iter().enumerate() {
            if let Err(err) = check_serializable(record) {
                writer.flush().map_err(FlushError::batch)?;
                return Err(FlushError::record(index, err));
            }
            writer.serialize(record).map_err(|err| {
                if err.is_io_error() {
                    FlushError::batch(err)
                } else {
                    FlushError::record(index, err)
                }
            })?;
        }
        writer.flush().map_err(FlushError::batch)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            debug!(node = %self.name, "closed csv file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser::{Serialize, Serializer};
    use std::fs;

    #[derive(Serialize)]
    struct Row {
        id: u32,
        name: String,
    }

    #[test]
    fn test_writes_header_for_structs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        let mut destination = CsvDestination::to_file("rows", &path);

        destination.setup().unwrap();
        destination
            .flush_batch(&[
                Row { id: 1, name: "a".into() },
                Row { id: 2, name: "b".into() },
            ])
            .unwrap();
        destination
            .flush_batch(&[Row { id: 3, name: "c".into() }])
            .unwrap();
        destination.close().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "id,name\n1,a\n2,b\n3,c\n");
    }

    #[test]
    fn test_array_records_have_no_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arrays.csv");
        let mut destination = CsvDestination::to_file("arrays", &path);

        destination
            .flush_batch(&[vec!["x".to_string(), "y".to_string()]])
            .unwrap();
        destination.close().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "x,y\n");
    }

    #[test]
    fn test_file_opened_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.csv");
        let mut destination: CsvDestination<Row> = CsvDestination::to_file("never", &path);

        destination.setup().unwrap();
        destination.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_path_fails_setup() {
        let mut destination: CsvDestination<Row> = CsvDestination::new("nowhere");
        assert!(matches!(destination.setup(), Err(PipelineError::Setup { .. })));
    }

    enum Cell {
        Text(&'static str),
        Broken,
    }

    impl Serialize for Cell {
        fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            match self {
                Cell::Text(text) => serializer.serialize_str(text),
                Cell::Broken => Err(serde::ser::Error::custom("unwritable cell")),
            }
        }
    }

    #[test]
    fn test_unserializable_record_is_record_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.csv");
        let mut destination = CsvDestination::to_file("cells", &path);

        let batch = [
            vec![Cell::Text("a")],
            vec![Cell::Broken],
            vec![Cell::Text("c")],
        ];
        match destination.flush_batch(&batch) {
            Err(FlushError::Record { index, .. }) => assert_eq!(index, 1),
            other => panic!("expected record error, got {other:?}"),
        }
        destination.flush_batch(&batch[2..]).unwrap();
        destination.close().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nc\n");
    }

    #[test]
    fn test_unopenable_file_is_batch_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no_such_dir").join("rows.csv");
        let mut destination = CsvDestination::to_file("rows", &path);
        destination.setup().unwrap();

        let rows = [Row {
            id: 1,
            name: "a".into(),
        }];
        match destination.flush_batch(&rows) {
            Err(FlushError::Batch(_)) => {}
            other => panic!("expected batch error, got {other:?}"),
        }
        assert!(!path.exists());
    }
}
