//! Named-field access on records.
//!
//! The pipeline core never looks inside a record. Nodes that need fields by
//! name go through a [`FieldMapper`] for the record shape at hand.

use crate::error::{PipelineError, Result};
use crate::stage::Transform;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::marker::PhantomData;

/// Value of a single record field
pub type FieldValue = Value;

/// Gets and sets named fields on records of type `R`
pub trait FieldMapper<R>: Send + Sync {
    /// Read `field`, or fail with `FieldNotFound`
    fn get(&self, record: &R, field: &str) -> Result<FieldValue>;

    /// Write `field`
    fn set(&self, record: &mut R, field: &str, value: FieldValue) -> Result<()>;
}

fn not_found(field: &str) -> PipelineError {
    PipelineError::FieldNotFound {
        field: field.to_string(),
    }
}

/// Positional records; field names are resolved through a column list
#[derive(Debug, Clone)]
pub struct ArrayMapper {
    columns: Vec<String>,
}

impl ArrayMapper {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    fn position(&self, field: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|column| column == field)
            .ok_or_else(|| not_found(field))
    }
}

impl FieldMapper<Vec<FieldValue>> for ArrayMapper {
    fn get(&self, record: &Vec<FieldValue>, field: &str) -> Result<FieldValue> {
        let index = self.position(field)?;
        record.get(index).cloned().ok_or_else(|| not_found(field))
    }

    fn set(&self, record: &mut Vec<FieldValue>, field: &str, value: FieldValue) -> Result<()> {
        let index = self.position(field)?;
        if record.len() <= index {
            record.resize(index + 1, Value::Null);
        }
        record[index] = value;
        Ok(())
    }
}

/// Dynamic records held as JSON objects
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectMapper;

impl FieldMapper<Map<String, Value>> for ObjectMapper {
    fn get(&self, record: &Map<String, Value>, field: &str) -> Result<FieldValue> {
        record.get(field).cloned().ok_or_else(|| not_found(field))
    }

    fn set(&self, record: &mut Map<String, Value>, field: &str, value: FieldValue) -> Result<()> {
        record.insert(field.to_string(), value);
        Ok(())
    }
}

/// Typed records accessed through their serde representation
pub struct SerdeMapper<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeMapper<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeMapper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> SerdeMapper<T> {
    fn to_object(record: &T) -> Result<Map<String, Value>> {
        match serde_json::to_value(record)? {
            Value::Object(object) => Ok(object),
            other => Err(PipelineError::StageError(format!(
                "record does not serialize to an object: {other}"
            ))),
        }
    }
}

impl<T: Serialize + DeserializeOwned> FieldMapper<T> for SerdeMapper<T> {
    fn get(&self, record: &T, field: &str) -> Result<FieldValue> {
        Self::to_object(record)?
            .remove(field)
            .ok_or_else(|| not_found(field))
    }

    fn set(&self, record: &mut T, field: &str, value: FieldValue) -> Result<()> {
        let mut object = Self::to_object(record)?;
        if !object.contains_key(field) {
            return Err(not_found(field));
        }
        object.insert(field.to_string(), value);
        *record = serde_json::from_value(Value::Object(object))?;
        Ok(())
    }
}

/// Copies input field `input` into output field `output`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub input: String,
    pub output: String,
}

impl ColumnMapping {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// Map a field onto a field of the same name
    pub fn same(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(field.clone(), field)
    }
}

/// Converts records between shapes by copying named fields
pub struct FieldMapTransform<I, O> {
    name: String,
    input_mapper: Box<dyn FieldMapper<I>>,
    output_mapper: Box<dyn FieldMapper<O>>,
    mappings: Vec<ColumnMapping>,
}

impl<I, O> FieldMapTransform<I, O> {
    pub fn new(
        name: impl Into<String>,
        input_mapper: impl FieldMapper<I> + 'static,
        output_mapper: impl FieldMapper<O> + 'static,
        mappings: Vec<ColumnMapping>,
    ) -> Self {
        Self {
            name: name.into(),
            input_mapper: Box::new(input_mapper),
            output_mapper: Box::new(output_mapper),
            mappings,
        }
    }
}

impl<I, O> Transform for FieldMapTransform<I, O>
where
    I: Send + 'static,
    O: Default + Send + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self) -> Result<()> {
        if self.mappings.is_empty() {
            return Err(PipelineError::Setup {
                node: self.name.clone(),
                reason: "no column mappings configured".into(),
            });
        }
        Ok(())
    }

    fn process(&mut self, input: I) -> Result<Vec<O>> {
        let mut output = O::default();
        for mapping in &self.mappings {
            let value = self.input_mapper.get(&input, &mapping.input)?;
            self.output_mapper.set(&mut output, &mapping.output, value)?;
        }
        Ok(vec![output])
    }
}
