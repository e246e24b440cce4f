//! Task names and stage graph construction.

use serde_json::json;
use uuid::Uuid;

use closet_queue::Signature;

pub const ORCHESTRATE_INDEXING: &str = "orchestrate_indexing";
pub const ORCHESTRATE_QUERYING: &str = "orchestrate_querying";
pub const DETECT_ITEMS: &str = "detect_items";
pub const FAN_OUT_INDEXING: &str = "fan_out_indexing";
pub const FAN_OUT_QUERYING: &str = "fan_out_querying";
pub const LABEL_ITEM: &str = "label_item";
pub const SELECT_AND_STORE: &str = "select_and_store";
pub const QUERY_ITEM: &str = "query_item";
pub const FINALIZE_INDEXING: &str = "finalize_indexing";
pub const FINALIZE_QUERYING: &str = "finalize_querying";
pub const MARK_JOB_FAILED: &str = "mark_job_failed";

/// Run `per_item` for every item in parallel, then `converge` with the
/// collected results in item order.
pub fn fan_out<T>(
    items: &[T],
    per_item: impl Fn(usize, &T) -> Signature,
    converge: Signature,
) -> Signature {
    let header = items
        .iter()
        .enumerate()
        .map(|(index, item)| per_item(index, item))
        .collect();
    Signature::chord(header, converge)
}

/// Detection followed by the indexing fan-out over its crops.
pub fn indexing_graph(job_id: Uuid, image_id: Uuid, product_id: Uuid, collection: &str) -> Signature {
    Signature::chain(vec![
        Signature::task(DETECT_ITEMS, json!({ "job_id": job_id, "image_id": image_id })),
        Signature::task(
            FAN_OUT_INDEXING,
            json!({ "job_id": job_id, "product_id": product_id, "collection": collection }),
        ),
    ])
}

/// Detection followed by the querying fan-out over its crops.
pub fn querying_graph(
    job_id: Uuid,
    image_id: Uuid,
    query_result_id: Uuid,
    collection: &str,
) -> Signature {
    Signature::chain(vec![
        Signature::task(DETECT_ITEMS, json!({ "job_id": job_id, "image_id": image_id })),
        Signature::task(
            FAN_OUT_QUERYING,
            json!({
                "job_id": job_id,
                "query_result_id": query_result_id,
                "collection": collection,
            }),
        ),
    ])
}

fn label_task(job_id: Uuid, crop_id: Uuid, index: usize, total: usize) -> Signature {
    Signature::task(
        LABEL_ITEM,
        json!({ "job_id": job_id, "crop_id": crop_id, "index": index, "total": total }),
    )
}

/// Label every crop, then pick and store the one matching the product.
pub fn indexing_fan_out(
    job_id: Uuid,
    product_id: Uuid,
    collection: &str,
    crop_ids: &[Uuid],
) -> Signature {
    let total = crop_ids.len();
    fan_out(
        crop_ids,
        |index, crop_id| label_task(job_id, *crop_id, index, total),
        Signature::chain(vec![
            Signature::task(
                SELECT_AND_STORE,
                json!({ "job_id": job_id, "product_id": product_id, "collection": collection }),
            ),
            Signature::task(
                FINALIZE_INDEXING,
                json!({ "job_id": job_id, "created_crop_ids": crop_ids }),
            ),
        ]),
    )
}

/// Label and query every crop independently, then complete the job.
pub fn querying_fan_out(
    job_id: Uuid,
    query_result_id: Uuid,
    collection: &str,
    crop_ids: &[Uuid],
) -> Signature {
    let total = crop_ids.len();
    fan_out(
        crop_ids,
        |index, crop_id| {
            label_task(job_id, *crop_id, index, total).then(Signature::task(
                QUERY_ITEM,
                json!({
                    "job_id": job_id,
                    "query_result_id": query_result_id,
                    "collection": collection,
                    "total": total,
                }),
            ))
        },
        Signature::task(FINALIZE_QUERYING, json!({ "job_id": job_id })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexing_fan_out_shape() {
        let crops = vec![Uuid::new_v4(), Uuid::new_v4()];
        let sig = indexing_fan_out(Uuid::new_v4(), Uuid::new_v4(), "c", &crops);
        let Signature::Chord { header, body } = sig else {
            panic!("expected chord");
        };
        assert_eq!(header.len(), 2);
        match &header[1] {
            Signature::Task(call) => {
                assert_eq!(call.name, LABEL_ITEM);
                assert_eq!(call.args["index"], 1);
                assert_eq!(call.args["total"], 2);
            }
            other => panic!("unexpected member {:?}", other),
        }
        assert!(matches!(*body, Signature::Chain(ref steps) if steps.len() == 2));
    }

    #[test]
    fn test_querying_members_are_chains() {
        let crops = vec![Uuid::new_v4(); 3];
        let sig = querying_fan_out(Uuid::new_v4(), Uuid::new_v4(), "c", &crops);
        let Signature::Chord { header, .. } = sig else {
            panic!("expected chord");
        };
        assert_eq!(header.len(), 3);
        assert!(header
            .iter()
            .all(|m| matches!(m, Signature::Chain(steps) if steps.len() == 2)));
    }

    #[test]
    fn test_fan_out_of_nothing() {
        let sig = fan_out(&[] as &[u8], |_, _| unreachable!(), Signature::task("body", json!({})));
        assert!(matches!(sig, Signature::Chord { ref header, .. } if header.is_empty()));
    }
}
