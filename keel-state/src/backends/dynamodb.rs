//! DynamoDB key-value backend

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue as DynamoValue, KeySchemaElement, KeyType,
    ProvisionedThroughput, ScalarAttributeType, TableStatus,
};
use tracing::{debug, info};

use crate::backend::BackendConfig;
use crate::kv::{
    AttributeValue, Condition, Item, KeyAttribute, KvBackend, KvError, KvResult, ScalarType,
    TableSpec,
};

/// How many times to poll DescribeTable after creating a table
const TABLE_ACTIVE_ATTEMPTS: u32 = 60;

/// Delay between DescribeTable polls
const TABLE_ACTIVE_POLL: Duration = Duration::from_secs(1);

/// DynamoDB-based key-value backend
pub struct DynamoDbBackend {
    client: Client,
}

impl DynamoDbBackend {
    /// Wrap an existing DynamoDB client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create a new DynamoDbBackend from configuration
    ///
    /// Recognised attributes are `region` and `endpoint` (e.g. a DynamoDB
    /// Local URL). Credentials and any missing region come from the default
    /// AWS provider chain.
    pub async fn from_config(config: &BackendConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = config.get_string("region") {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_dynamodb::config::Builder::from(&sdk_config);
        if let Some(endpoint) = config.get_string("endpoint") {
            builder = builder.endpoint_url(endpoint);
        }

        Self::new(Client::from_conf(builder.build()))
    }

    /// Poll until the table reports ACTIVE
    async fn wait_until_active(&self, table: &str) -> KvResult<()> {
        for _ in 0..TABLE_ACTIVE_ATTEMPTS {
            match self.client.describe_table().table_name(table).send().await {
                Ok(output) => {
                    if output.table().and_then(|t| t.table_status()) == Some(&TableStatus::Active)
                    {
                        return Ok(());
                    }
                }
                // Freshly created tables may not be visible yet
                Err(err) if is_table_missing(&err) => {}
                Err(err) => return Err(classify(err, table)),
            }
            tokio::time::sleep(TABLE_ACTIVE_POLL).await;
        }

        Err(KvError::Service(format!(
            "Table {} did not become active after {} attempts",
            table, TABLE_ACTIVE_ATTEMPTS
        )))
    }
}

#[async_trait]
impl KvBackend for DynamoDbBackend {
    async fn get_item(&self, table: &str, key: &Item) -> KvResult<Option<Item>> {
        debug!(table, "get_item");
        let output = self
            .client
            .get_item()
            .table_name(table)
            .set_key(Some(to_dynamo_item(key)))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| classify(e, table))?;

        output.item().map(from_dynamo_item).transpose()
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<&Condition>,
    ) -> KvResult<()> {
        debug!(table, conditional = condition.is_some(), "put_item");
        let mut request = self
            .client
            .put_item()
            .table_name(table)
            .set_item(Some(to_dynamo_item(&item)));

        if let Some(condition) = condition {
            let expression = Expression::render(condition);
            request = request
                .condition_expression(expression.text)
                .set_expression_attribute_names(Some(expression.names));
            if !expression.values.is_empty() {
                request = request.set_expression_attribute_values(Some(expression.values));
            }
        }

        request.send().await.map_err(|e| classify(e, table))?;
        Ok(())
    }

    async fn delete_item(
        &self,
        table: &str,
        key: &Item,
        condition: Option<&Condition>,
    ) -> KvResult<()> {
        debug!(table, conditional = condition.is_some(), "delete_item");
        let mut request = self
            .client
            .delete_item()
            .table_name(table)
            .set_key(Some(to_dynamo_item(key)));

        if let Some(condition) = condition {
            let expression = Expression::render(condition);
            request = request
                .condition_expression(expression.text)
                .set_expression_attribute_names(Some(expression.names));
            if !expression.values.is_empty() {
                request = request.set_expression_attribute_values(Some(expression.values));
            }
        }

        request.send().await.map_err(|e| classify(e, table))?;
        Ok(())
    }

    async fn query_latest(
        &self,
        table: &str,
        partition_key: &str,
        partition_value: &AttributeValue,
    ) -> KvResult<Option<Item>> {
        debug!(table, "query_latest");
        let output = self
            .client
            .query()
            .table_name(table)
            .key_condition_expression("#pk = :pk")
            .expression_attribute_names("#pk", partition_key)
            .expression_attribute_values(":pk", to_dynamo(partition_value))
            .scan_index_forward(false)
            .limit(1)
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| classify(e, table))?;

        output.items().first().map(from_dynamo_item).transpose()
    }

    async fn create_table(&self, spec: &TableSpec) -> KvResult<()> {
        let mut definitions = vec![attribute_definition(&spec.partition_key)?];
        let mut key_schema = vec![key_schema_element(&spec.partition_key, KeyType::Hash)?];
        if let Some(sort_key) = &spec.sort_key {
            definitions.push(attribute_definition(sort_key)?);
            key_schema.push(key_schema_element(sort_key, KeyType::Range)?);
        }

        let throughput = ProvisionedThroughput::builder()
            .read_capacity_units(spec.read_capacity)
            .write_capacity_units(spec.write_capacity)
            .build()
            .map_err(|e| KvError::Service(e.to_string()))?;

        let result = self
            .client
            .create_table()
            .table_name(&spec.name)
            .set_attribute_definitions(Some(definitions))
            .set_key_schema(Some(key_schema))
            .provisioned_throughput(throughput)
            .send()
            .await;

        match result {
            Ok(_) => info!(table = %spec.name, "Created table"),
            // Another operator got there first
            Err(err) if is_table_in_use(&err) => {
                debug!(table = %spec.name, "Table is already being created");
            }
            Err(err) => return Err(classify(err, &spec.name)),
        }

        self.wait_until_active(&spec.name).await
    }
}

fn attribute_definition(key: &KeyAttribute) -> KvResult<AttributeDefinition> {
    let attribute_type = match key.scalar_type {
        ScalarType::String => ScalarAttributeType::S,
        ScalarType::Number => ScalarAttributeType::N,
    };
    AttributeDefinition::builder()
        .attribute_name(&key.name)
        .attribute_type(attribute_type)
        .build()
        .map_err(|e| KvError::Service(e.to_string()))
}

fn key_schema_element(key: &KeyAttribute, key_type: KeyType) -> KvResult<KeySchemaElement> {
    KeySchemaElement::builder()
        .attribute_name(&key.name)
        .key_type(key_type)
        .build()
        .map_err(|e| KvError::Service(e.to_string()))
}

const CONDITION_FAILED: &str = "ConditionalCheckFailedException";
const RESOURCE_NOT_FOUND: &str = "ResourceNotFoundException";
const RESOURCE_IN_USE: &str = "ResourceInUseException";

/// Map an SDK error onto the backend-neutral error kinds
fn classify<E, R>(err: SdkError<E, R>, table: &str) -> KvError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match err.code() {
        Some(CONDITION_FAILED) => KvError::ConditionFailed,
        Some(RESOURCE_NOT_FOUND) => KvError::TableNotFound(table.to_string()),
        _ => KvError::Service(DisplayErrorContext(&err).to_string()),
    }
}

fn is_table_missing<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
    err.code() == Some(RESOURCE_NOT_FOUND)
}

/// CreateTable reports an existing or in-progress table as in use
fn is_table_in_use<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
    err.code() == Some(RESOURCE_IN_USE)
}

/// A condition expression with its placeholder maps
#[derive(Debug, Default)]
struct Expression {
    text: String,
    names: HashMap<String, String>,
    values: HashMap<String, DynamoValue>,
}

impl Expression {
    fn render(condition: &Condition) -> Self {
        let mut expression = Self::default();
        let text = expression.render_condition(condition);
        Self { text, ..expression }
    }

    fn render_condition(&mut self, condition: &Condition) -> String {
        match condition {
            Condition::AttributeNotExists(name) => {
                format!("attribute_not_exists({})", self.name(name))
            }
            Condition::Equals(name, value) => {
                format!("{} = {}", self.name(name), self.value(value))
            }
            Condition::Or(left, right) => format!(
                "({}) OR ({})",
                self.render_condition(left),
                self.render_condition(right)
            ),
        }
    }

    fn name(&mut self, name: &str) -> String {
        if let Some((placeholder, _)) = self.names.iter().find(|(_, n)| n.as_str() == name) {
            return placeholder.clone();
        }
        let placeholder = format!("#n{}", self.names.len());
        self.names.insert(placeholder.clone(), name.to_string());
        placeholder
    }

    fn value(&mut self, value: &AttributeValue) -> String {
        let placeholder = format!(":v{}", self.values.len());
        self.values.insert(placeholder.clone(), to_dynamo(value));
        placeholder
    }
}

fn to_dynamo(value: &AttributeValue) -> DynamoValue {
    match value {
        AttributeValue::S(s) => DynamoValue::S(s.clone()),
        AttributeValue::N(n) => DynamoValue::N(n.to_string()),
        AttributeValue::M(m) => DynamoValue::M(
            m.iter()
                .map(|(k, v)| (k.clone(), to_dynamo(v)))
                .collect(),
        ),
    }
}

fn from_dynamo(value: &DynamoValue) -> KvResult<AttributeValue> {
    match value {
        DynamoValue::S(s) => Ok(AttributeValue::S(s.clone())),
        DynamoValue::N(n) => n
            .parse()
            .map(AttributeValue::N)
            .map_err(|_| KvError::Service(format!("Unsupported number attribute: {}", n))),
        DynamoValue::M(m) => m
            .iter()
            .map(|(k, v)| Ok((k.clone(), from_dynamo(v)?)))
            .collect::<KvResult<_>>()
            .map(AttributeValue::M),
        other => Err(KvError::Service(format!(
            "Unsupported attribute type: {:?}",
            other
        ))),
    }
}

fn to_dynamo_item(item: &Item) -> HashMap<String, DynamoValue> {
    item.iter()
        .map(|(k, v)| (k.clone(), to_dynamo(v)))
        .collect()
}

fn from_dynamo_item(item: &HashMap<String, DynamoValue>) -> KvResult<Item> {
    item.iter()
        .map(|(k, v)| Ok((k.clone(), from_dynamo(v)?)))
        .collect()
}
