use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use quick_xml::escape::escape;
use uuid::Uuid;

use crate::bus::Bus;
use crate::error::{BusError, BusResult, ErrorKind};
use crate::observer::Service;
use crate::sns::error::SnsError;
use crate::sns::types::*;

const NS: &str = "http://sns.amazonaws.com/doc/2010-03-31/";

const ACTIONS: &[&str] = &[
    "CreateTopic",
    "DeleteTopic",
    "ListTopics",
    "GetTopicAttributes",
    "SetTopicAttributes",
    "Subscribe",
    "Unsubscribe",
    "ListSubscriptions",
    "ListSubscriptionsByTopic",
    "GetSubscriptionAttributes",
    "SetSubscriptionAttributes",
    "Publish",
    "PublishBatch",
    "TagResource",
    "UntagResource",
    "ListTagsForResource",
    "AddPermission",
    "RemovePermission",
];

// ── form parsing helpers ───────────────────────────────────────────────

type Params = HashMap<String, String>;

fn parse_form(body: &str) -> Params {
    form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect()
}

fn param(params: &Params, key: &str) -> Option<String> {
    params.get(key).cloned()
}

fn require(params: &Params, key: &str) -> BusResult<String> {
    param(params, key).ok_or_else(|| {
        BusError::invalid_parameter(format!("Missing required parameter: {key}"))
    })
}

fn non_empty<K, V>(map: HashMap<K, V>) -> Option<HashMap<K, V>> {
    (!map.is_empty()).then_some(map)
}

/// `Prefix.entry.N.key` / `Prefix.entry.N.value`
fn parse_attributes(params: &Params, prefix: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for i in 1.. {
        let k = format!("{prefix}.entry.{i}.key");
        let v = format!("{prefix}.entry.{i}.value");
        match (params.get(&k), params.get(&v)) {
            (Some(key), Some(val)) => {
                map.insert(key.clone(), val.clone());
            }
            _ => break,
        }
    }
    map
}

/// `Prefix.entry.N.Name` with `.Value.DataType`, `.Value.StringValue` and
/// `.Value.BinaryValue`.
fn parse_message_attributes(params: &Params, prefix: &str) -> HashMap<String, MessageAttributeValue> {
    let mut map = HashMap::new();
    for i in 1.. {
        let entry = format!("{prefix}.entry.{i}");
        let Some(name) = params.get(&format!("{entry}.Name")) else {
            break;
        };
        map.insert(
            name.clone(),
            MessageAttributeValue {
                data_type: param(params, &format!("{entry}.Value.DataType")).unwrap_or_default(),
                string_value: param(params, &format!("{entry}.Value.StringValue")),
                binary_value: param(params, &format!("{entry}.Value.BinaryValue")),
            },
        );
    }
    map
}

/// `Prefix.member.N.Key` / `Prefix.member.N.Value`
fn parse_tags(params: &Params, prefix: &str) -> Vec<Tag> {
    let mut tags = Vec::new();
    for i in 1.. {
        let k = format!("{prefix}.member.{i}.Key");
        let v = format!("{prefix}.member.{i}.Value");
        match (params.get(&k), params.get(&v)) {
            (Some(key), Some(val)) => tags.push(Tag {
                key: key.clone(),
                value: val.clone(),
            }),
            _ => break,
        }
    }
    tags
}

/// `Prefix.member.N`
fn parse_string_list(params: &Params, prefix: &str) -> Vec<String> {
    (1..)
        .map_while(|i| params.get(&format!("{prefix}.member.{i}")).cloned())
        .collect()
}

fn parse_batch_entries(params: &Params, prefix: &str) -> Vec<PublishBatchEntry> {
    let mut entries = Vec::new();
    for i in 1.. {
        let member = format!("{prefix}.member.{i}");
        let Some(id) = params.get(&format!("{member}.Id")) else {
            break;
        };
        entries.push(PublishBatchEntry {
            id: id.clone(),
            message: param(params, &format!("{member}.Message")).unwrap_or_default(),
            subject: param(params, &format!("{member}.Subject")),
            message_structure: param(params, &format!("{member}.MessageStructure")),
            message_attributes: non_empty(parse_message_attributes(
                params,
                &format!("{member}.MessageAttributes"),
            )),
            message_deduplication_id: param(params, &format!("{member}.MessageDeduplicationId")),
            message_group_id: param(params, &format!("{member}.MessageGroupId")),
        });
    }
    entries
}

// ── XML response helpers ───────────────────────────────────────────────

fn xml_ok(action: &str, result_body: &str) -> Response {
    let xml = format!(
        r#"<{action}Response xmlns="{NS}">
  <{action}Result>
{result_body}
  </{action}Result>
  <ResponseMetadata>
    <RequestId>{rid}</RequestId>
  </ResponseMetadata>
</{action}Response>"#,
        rid = Uuid::new_v4(),
    );
    (
        axum::http::StatusCode::OK,
        [("content-type", "text/xml")],
        xml,
    )
        .into_response()
}

fn xml_empty(action: &str) -> Response {
    let xml = format!(
        r#"<{action}Response xmlns="{NS}">
  <ResponseMetadata>
    <RequestId>{rid}</RequestId>
  </ResponseMetadata>
</{action}Response>"#,
        rid = Uuid::new_v4(),
    );
    (
        axum::http::StatusCode::OK,
        [("content-type", "text/xml")],
        xml,
    )
        .into_response()
}

fn attributes_xml(attrs: &HashMap<String, String>) -> String {
    let mut xml = String::from("    <Attributes>\n");
    let mut keys: Vec<&String> = attrs.keys().collect();
    keys.sort();
    for key in keys {
        xml.push_str(&format!(
            "      <entry><key>{}</key><value>{}</value></entry>\n",
            escape(key.as_str()),
            escape(attrs[key].as_str()),
        ));
    }
    xml.push_str("    </Attributes>");
    xml
}

fn next_token_xml(body: &mut String, next_token: Option<&str>) {
    if let Some(token) = next_token {
        body.push_str(&format!("\n    <NextToken>{}</NextToken>", escape(token)));
    }
}

fn subscriptions_xml(subs: &[SubscriptionEntry], next_token: Option<&str>) -> String {
    let mut body = String::from("    <Subscriptions>\n");
    for s in subs {
        body.push_str(&format!(
            "      <member>\n        <TopicArn>{}</TopicArn>\n        <Protocol>{}</Protocol>\n        <SubscriptionArn>{}</SubscriptionArn>\n        <Owner>{}</Owner>\n        <Endpoint>{}</Endpoint>\n      </member>\n",
            escape(s.topic_arn.as_str()),
            escape(s.protocol.as_str()),
            escape(s.subscription_arn.as_str()),
            escape(s.owner.as_str()),
            escape(s.endpoint.as_str()),
        ));
    }
    body.push_str("    </Subscriptions>");
    next_token_xml(&mut body, next_token);
    body
}

// ── dispatch ───────────────────────────────────────────────────────────

/// The ARN an action acts on, as far as the parameters name one.
fn resource_of(bus: &Bus, params: &Params) -> Option<String> {
    ["TopicArn", "TargetArn", "SubscriptionArn", "ResourceArn"]
        .iter()
        .find_map(|k| param(params, k))
        .or_else(|| params.get("Name").map(|name| bus.topic_arn(name)))
}

async fn handle_request(
    State(bus): State<Arc<Bus>>,
    body: String,
) -> Result<Response, SnsError> {
    let params = parse_form(&body);
    let requested = param(&params, "Action")
        .ok_or_else(|| BusError::new(ErrorKind::InvalidAction, "Missing Action parameter"))?;
    let action = ACTIONS
        .iter()
        .copied()
        .find(|a| *a == requested)
        .ok_or_else(|| {
            BusError::new(ErrorKind::InvalidAction, format!("Unknown action: {requested}"))
        })?;

    let resource = resource_of(&bus, &params);
    let result = match action {
        "CreateTopic" => handle_create_topic(&bus, params).await,
        "DeleteTopic" => handle_delete_topic(&bus, params).await,
        "ListTopics" => handle_list_topics(&bus, params).await,
        "GetTopicAttributes" => handle_get_topic_attributes(&bus, params).await,
        "SetTopicAttributes" => handle_set_topic_attributes(&bus, params).await,
        "Subscribe" => handle_subscribe(&bus, params).await,
        "Unsubscribe" => handle_unsubscribe(&bus, params).await,
        "ListSubscriptions" => handle_list_subscriptions(&bus, params).await,
        "ListSubscriptionsByTopic" => handle_list_subscriptions_by_topic(&bus, params).await,
        "GetSubscriptionAttributes" => handle_get_subscription_attributes(&bus, params).await,
        "SetSubscriptionAttributes" => handle_set_subscription_attributes(&bus, params).await,
        "Publish" => handle_publish(&bus, params).await,
        "PublishBatch" => handle_publish_batch(&bus, params).await,
        "TagResource" => handle_tag_resource(&bus, params).await,
        "UntagResource" => handle_untag_resource(&bus, params).await,
        "ListTagsForResource" => handle_list_tags_for_resource(&bus, params).await,
        "AddPermission" => handle_add_permission(&bus, params).await,
        "RemovePermission" => handle_remove_permission(&bus, params).await,
        _ => Err(BusError::new(
            ErrorKind::InvalidAction,
            format!("Unknown action: {action}"),
        )),
    };
    bus.record(Service::Sns, action, resource, result.is_ok());
    Ok(result?)
}

// ── action handlers ────────────────────────────────────────────────────

async fn handle_create_topic(bus: &Bus, params: Params) -> BusResult<Response> {
    let tags = parse_tags(&params, "Tags");
    let req = CreateTopicRequest {
        name: require(&params, "Name")?,
        attributes: non_empty(parse_attributes(&params, "Attributes")),
        tags: (!tags.is_empty()).then_some(tags),
    };
    let resp = bus.create_topic(req).await?;
    Ok(xml_ok(
        "CreateTopic",
        &format!("    <TopicArn>{}</TopicArn>", escape(resp.topic_arn.as_str())),
    ))
}

async fn handle_delete_topic(bus: &Bus, params: Params) -> BusResult<Response> {
    let topic_arn = require(&params, "TopicArn")?;
    bus.delete_topic(DeleteTopicRequest { topic_arn }).await?;
    Ok(xml_empty("DeleteTopic"))
}

async fn handle_list_topics(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = ListTopicsRequest {
        next_token: param(&params, "NextToken"),
    };
    let resp = bus.list_topics(req).await?;
    let mut body = String::from("    <Topics>\n");
    for arn in &resp.topics {
        body.push_str(&format!(
            "      <member><TopicArn>{}</TopicArn></member>\n",
            escape(arn.as_str())
        ));
    }
    body.push_str("    </Topics>");
    next_token_xml(&mut body, resp.next_token.as_deref());
    Ok(xml_ok("ListTopics", &body))
}

async fn handle_get_topic_attributes(bus: &Bus, params: Params) -> BusResult<Response> {
    let topic_arn = require(&params, "TopicArn")?;
    let resp = bus
        .get_topic_attributes(GetTopicAttributesRequest { topic_arn })
        .await?;
    Ok(xml_ok("GetTopicAttributes", &attributes_xml(&resp.attributes)))
}

async fn handle_set_topic_attributes(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = SetTopicAttributesRequest {
        topic_arn: require(&params, "TopicArn")?,
        attribute_name: require(&params, "AttributeName")?,
        attribute_value: param(&params, "AttributeValue"),
    };
    bus.set_topic_attributes(req).await?;
    Ok(xml_empty("SetTopicAttributes"))
}

async fn handle_subscribe(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = SubscribeRequest {
        topic_arn: require(&params, "TopicArn")?,
        protocol: require(&params, "Protocol")?,
        endpoint: param(&params, "Endpoint"),
        attributes: non_empty(parse_attributes(&params, "Attributes")),
        return_subscription_arn: param(&params, "ReturnSubscriptionArn").map(|v| v == "true"),
    };
    let resp = bus.subscribe(req).await?;
    Ok(xml_ok(
        "Subscribe",
        &format!(
            "    <SubscriptionArn>{}</SubscriptionArn>",
            escape(resp.subscription_arn.as_str())
        ),
    ))
}

async fn handle_unsubscribe(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = UnsubscribeRequest {
        subscription_arn: require(&params, "SubscriptionArn")?,
    };
    bus.unsubscribe(req).await?;
    Ok(xml_empty("Unsubscribe"))
}

async fn handle_list_subscriptions(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = ListSubscriptionsRequest {
        next_token: param(&params, "NextToken"),
    };
    let resp = bus.list_subscriptions(req).await?;
    Ok(xml_ok(
        "ListSubscriptions",
        &subscriptions_xml(&resp.subscriptions, resp.next_token.as_deref()),
    ))
}

async fn handle_list_subscriptions_by_topic(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = ListSubscriptionsByTopicRequest {
        topic_arn: require(&params, "TopicArn")?,
        next_token: param(&params, "NextToken"),
    };
    let resp = bus.list_subscriptions_by_topic(req).await?;
    Ok(xml_ok(
        "ListSubscriptionsByTopic",
        &subscriptions_xml(&resp.subscriptions, resp.next_token.as_deref()),
    ))
}

async fn handle_get_subscription_attributes(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = GetSubscriptionAttributesRequest {
        subscription_arn: require(&params, "SubscriptionArn")?,
    };
    let resp = bus.get_subscription_attributes(req).await?;
    Ok(xml_ok(
        "GetSubscriptionAttributes",
        &attributes_xml(&resp.attributes),
    ))
}

async fn handle_set_subscription_attributes(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = SetSubscriptionAttributesRequest {
        subscription_arn: require(&params, "SubscriptionArn")?,
        attribute_name: require(&params, "AttributeName")?,
        attribute_value: param(&params, "AttributeValue"),
    };
    bus.set_subscription_attributes(req).await?;
    Ok(xml_empty("SetSubscriptionAttributes"))
}

async fn handle_publish(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = PublishRequest {
        topic_arn: param(&params, "TopicArn"),
        target_arn: param(&params, "TargetArn"),
        message: require(&params, "Message")?,
        subject: param(&params, "Subject"),
        message_structure: param(&params, "MessageStructure"),
        message_attributes: non_empty(parse_message_attributes(&params, "MessageAttributes")),
        message_deduplication_id: param(&params, "MessageDeduplicationId"),
        message_group_id: param(&params, "MessageGroupId"),
    };
    let resp = bus.publish(req).await?;
    let mut body = format!("    <MessageId>{}</MessageId>", escape(resp.message_id.as_str()));
    if let Some(ref seq) = resp.sequence_number {
        body.push_str(&format!(
            "\n    <SequenceNumber>{}</SequenceNumber>",
            escape(seq.as_str())
        ));
    }
    Ok(xml_ok("Publish", &body))
}

async fn handle_publish_batch(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = PublishBatchRequest {
        topic_arn: require(&params, "TopicArn")?,
        publish_batch_request_entries: parse_batch_entries(&params, "PublishBatchRequestEntries"),
    };
    let resp = bus.publish_batch(req).await?;

    let mut body = String::from("    <Successful>\n");
    for s in &resp.successful {
        body.push_str("      <member>\n");
        body.push_str(&format!("        <Id>{}</Id>\n", escape(s.id.as_str())));
        body.push_str(&format!(
            "        <MessageId>{}</MessageId>\n",
            escape(s.message_id.as_str())
        ));
        if let Some(ref seq) = s.sequence_number {
            body.push_str(&format!(
                "        <SequenceNumber>{}</SequenceNumber>\n",
                escape(seq.as_str())
            ));
        }
        body.push_str("      </member>\n");
    }
    body.push_str("    </Successful>\n");

    body.push_str("    <Failed>\n");
    for f in &resp.failed {
        body.push_str("      <member>\n");
        body.push_str(&format!("        <Id>{}</Id>\n", escape(f.id.as_str())));
        body.push_str(&format!("        <Code>{}</Code>\n", escape(f.code.as_str())));
        body.push_str(&format!(
            "        <Message>{}</Message>\n",
            escape(f.message.as_str())
        ));
        body.push_str(&format!(
            "        <SenderFault>{}</SenderFault>\n",
            f.sender_fault
        ));
        body.push_str("      </member>\n");
    }
    body.push_str("    </Failed>");

    Ok(xml_ok("PublishBatch", &body))
}

async fn handle_tag_resource(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = TagResourceRequest {
        resource_arn: require(&params, "ResourceArn")?,
        tags: parse_tags(&params, "Tags"),
    };
    bus.tag_resource(req).await?;
    Ok(xml_empty("TagResource"))
}

async fn handle_untag_resource(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = UntagResourceRequest {
        resource_arn: require(&params, "ResourceArn")?,
        tag_keys: parse_string_list(&params, "TagKeys"),
    };
    bus.untag_resource(req).await?;
    Ok(xml_empty("UntagResource"))
}

async fn handle_list_tags_for_resource(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = ListTagsForResourceRequest {
        resource_arn: require(&params, "ResourceArn")?,
    };
    let resp = bus.list_tags_for_resource(req).await?;
    let mut body = String::from("    <Tags>\n");
    for tag in &resp.tags {
        body.push_str(&format!(
            "      <member><Key>{}</Key><Value>{}</Value></member>\n",
            escape(tag.key.as_str()),
            escape(tag.value.as_str()),
        ));
    }
    body.push_str("    </Tags>");
    Ok(xml_ok("ListTagsForResource", &body))
}

async fn handle_add_permission(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = AddPermissionRequest {
        topic_arn: require(&params, "TopicArn")?,
        label: require(&params, "Label")?,
        aws_account_ids: parse_string_list(&params, "AWSAccountId"),
        action_names: parse_string_list(&params, "ActionName"),
    };
    bus.add_topic_permission(req).await?;
    Ok(xml_empty("AddPermission"))
}

async fn handle_remove_permission(bus: &Bus, params: Params) -> BusResult<Response> {
    let req = RemovePermissionRequest {
        topic_arn: require(&params, "TopicArn")?,
        label: require(&params, "Label")?,
    };
    bus.remove_topic_permission(req).await?;
    Ok(xml_empty("RemovePermission"))
}

// ── router ─────────────────────────────────────────────────────────────

pub fn create_router(bus: Arc<Bus>) -> Router {
    Router::new()
        .route("/", post(handle_request))
        .with_state(bus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn message_attributes_parse_from_entries() {
        let p = params(&[
            ("MessageAttributes.entry.1.Name", "kind"),
            ("MessageAttributes.entry.1.Value.DataType", "String"),
            ("MessageAttributes.entry.1.Value.StringValue", "order"),
            ("MessageAttributes.entry.2.Name", "count"),
            ("MessageAttributes.entry.2.Value.DataType", "Number"),
            ("MessageAttributes.entry.2.Value.StringValue", "3"),
        ]);
        let attrs = parse_message_attributes(&p, "MessageAttributes");
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["kind"], MessageAttributeValue::string("order"));
        assert_eq!(attrs["count"], MessageAttributeValue::number(3));
    }

    #[test]
    fn batch_entries_stop_at_first_gap() {
        let p = params(&[
            ("E.member.1.Id", "a"),
            ("E.member.1.Message", "one"),
            ("E.member.2.Id", "b"),
            ("E.member.2.Message", "two"),
            ("E.member.2.MessageGroupId", "g"),
            ("E.member.4.Id", "d"),
        ]);
        let entries = parse_batch_entries(&p, "E");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].message_group_id.as_deref(), Some("g"));
        assert_eq!(parse_string_list(&params(&[("K.member.1", "x")]), "K"), vec!["x"]);
    }
}
