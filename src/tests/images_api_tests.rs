#[cfg(test)]
mod tests {
    use axum::http::{header, Method, StatusCode};
    use serde_json::{json, Value};

    use crate::tests::{body_json, multipart_request, request, seed_vehicle, Cookies, TestApp, ADMIN_EMAIL, PNG_BYTES};

    const JPEG_BYTES: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 16, b'J', b'F', b'I', b'F', 0];

    async fn upload(t: &TestApp, cookies: &Cookies, vehicle_id: &str, extra: &[(&str, &str)]) -> Value {
        let uri = format!("/api/admin/vehicles/{}/images", vehicle_id);
        let res = t.send(multipart_request(&uri, cookies, "image/png", PNG_BYTES, extra)).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        body_json(res).await
    }

    async fn list(t: &TestApp, cookies: &Cookies, vehicle_id: &str) -> Vec<Value> {
        let res = t.get(&format!("/api/admin/vehicles/{}/images", vehicle_id), Some(cookies)).await;
        assert_eq!(res.status(), StatusCode::OK);
        body_json(res).await.as_array().unwrap().clone()
    }

    fn primaries(images: &[Value]) -> Vec<String> {
        images.iter().filter(|i| i["is_primary"] == true).map(|i| i["id"].as_str().unwrap().to_string()).collect()
    }

    async fn setup() -> (TestApp, Cookies, String) {
        let t = TestApp::new().await;
        let cookies = t.login_admin().await;
        let vehicle = seed_vehicle(&t.state, "Toyota", "Prius", 2019, 1_500_000, 50_000, "available", false).await;
        (t, cookies, vehicle)
    }

    #[tokio::test]
    async fn first_upload_becomes_primary() {
        let (t, cookies, vehicle) = setup().await;

        let first = upload(&t, &cookies, &vehicle, &[("alt_text", "Front view")]).await;
        assert_eq!(first["is_primary"], true);
        assert_eq!(first["position"], 0);
        assert_eq!(first["alt_text"], "Front view");
        assert_eq!(first["content_type"], "image/png");
        assert_eq!(first["size_bytes"], PNG_BYTES.len());
        assert!(first.get("storage_path").is_none());
        let url = first["url"].as_str().unwrap();
        assert!(url.starts_with(&format!("/storage/vehicles/{}/", vehicle)));
        assert!(url.ends_with(".png"));

        let key = url.trim_start_matches("/storage/");
        assert_eq!(std::fs::read(t.storage_root().join(key)).unwrap(), PNG_BYTES);

        let second = upload(&t, &cookies, &vehicle, &[]).await;
        assert_eq!(second["is_primary"], false);
        assert_eq!(second["position"], 1);
    }

    #[tokio::test]
    async fn explicit_primary_moves_the_flag() {
        let (t, cookies, vehicle) = setup().await;
        upload(&t, &cookies, &vehicle, &[]).await;
        let chosen = upload(&t, &cookies, &vehicle, &[("is_primary", "true")]).await;

        let images = list(&t, &cookies, &vehicle).await;
        assert_eq!(images.len(), 2);
        assert_eq!(primaries(&images), vec![chosen["id"].as_str().unwrap().to_string()]);
    }

    #[tokio::test]
    async fn deleting_primary_promotes_lowest_position() {
        let (t, cookies, vehicle) = setup().await;
        let a = upload(&t, &cookies, &vehicle, &[]).await;
        let b = upload(&t, &cookies, &vehicle, &[]).await;
        let c = upload(&t, &cookies, &vehicle, &[]).await;
        let a_id = a["id"].as_str().unwrap();
        let a_file = t.storage_root().join(a["url"].as_str().unwrap().trim_start_matches("/storage/"));
        assert!(a_file.exists());

        let res = t.send(request(Method::DELETE, &format!("/api/admin/images/{}", a_id), None, Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(!a_file.exists());

        let images = list(&t, &cookies, &vehicle).await;
        assert_eq!(images.len(), 2);
        assert_eq!(primaries(&images), vec![b["id"].as_str().unwrap().to_string()]);

        // Deleting a non-primary image leaves the flag alone
        let c_id = c["id"].as_str().unwrap();
        t.send(request(Method::DELETE, &format!("/api/admin/images/{}", c_id), None, Some(&cookies))).await;
        let images = list(&t, &cookies, &vehicle).await;
        assert_eq!(primaries(&images), vec![b["id"].as_str().unwrap().to_string()]);

        let res = t.send(request(Method::DELETE, &format!("/api/admin/images/{}", c_id), None, Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn set_primary_is_exclusive() {
        let (t, cookies, vehicle) = setup().await;
        upload(&t, &cookies, &vehicle, &[]).await;
        let second = upload(&t, &cookies, &vehicle, &[]).await;
        let id = second["id"].as_str().unwrap();

        let res = t.send(request(Method::PUT, &format!("/api/admin/images/{}/primary", id), None, Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::OK);
        let images = body_json(res).await;
        assert_eq!(primaries(images.as_array().unwrap()), vec![id.to_string()]);

        let unknown = format!("/api/admin/images/{}/primary", uuid::Uuid::new_v4());
        let res = t.send(request(Method::PUT, &unknown, None, Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn primary_and_order_changes_are_audited() {
        let (t, cookies, vehicle) = setup().await;
        let first = upload(&t, &cookies, &vehicle, &[]).await["id"].as_str().unwrap().to_string();
        let second = upload(&t, &cookies, &vehicle, &[]).await["id"].as_str().unwrap().to_string();

        let res = t.send(request(Method::PUT, &format!("/api/admin/images/{}/primary", second), None, Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::OK);
        let uri = format!("/api/admin/vehicles/{}/images/order", vehicle);
        let res = t.send(request(Method::PUT, &uri, Some(json!({ "image_ids": [&second, &first] })), Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::OK);

        let entries = t.state.audit.recent(10).await.unwrap();
        let primary = entries.iter().find(|e| e.event == "image_primary_set").unwrap();
        assert_eq!(primary.target.as_deref(), Some(second.as_str()));
        assert_eq!(primary.actor_email.as_deref(), Some(ADMIN_EMAIL));
        let reorder = entries.iter().find(|e| e.event == "images_reordered").unwrap();
        assert_eq!(reorder.target.as_deref(), Some(vehicle.as_str()));
        assert!(reorder.details.as_deref().unwrap().contains(&second));
    }

    #[tokio::test]
    async fn image_changes_on_deleted_vehicle_are_not_found() {
        let (t, cookies, vehicle) = setup().await;
        let image = upload(&t, &cookies, &vehicle, &[]).await["id"].as_str().unwrap().to_string();
        sqlx::query("UPDATE vehicles SET deleted_at = '2024-01-01T00:00:00Z' WHERE id = ?1")
            .bind(&vehicle)
            .execute(&t.state.db)
            .await
            .unwrap();

        let res = t.send(request(Method::PUT, &format!("/api/admin/images/{}/primary", image), None, Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let uri = format!("/api/admin/vehicles/{}/images/order", vehicle);
        let res = t.send(request(Method::PUT, &uri, Some(json!({ "image_ids": [&image] })), Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let res = t.send(request(Method::DELETE, &format!("/api/admin/images/{}", image), None, Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        assert_eq!(list(&t, &cookies, &vehicle).await.len(), 1);
        let entries = t.state.audit.recent(10).await.unwrap();
        assert!(!entries.iter().any(|e| e.event == "image_deleted" || e.event == "image_primary_set"));
    }

    #[tokio::test]
    async fn reorder_requires_exact_permutation() {
        let (t, cookies, vehicle) = setup().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(upload(&t, &cookies, &vehicle, &[]).await["id"].as_str().unwrap().to_string());
        }
        let uri = format!("/api/admin/vehicles/{}/images/order", vehicle);

        let reversed: Vec<String> = ids.iter().rev().cloned().collect();
        let res = t.send(request(Method::PUT, &uri, Some(json!({ "image_ids": reversed })), Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::OK);
        let ordered: Vec<String> = body_json(res)
            .await
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ordered, reversed);

        let partial = json!({ "image_ids": &ids[..2] });
        let res = t.send(request(Method::PUT, &uri, Some(partial), Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let duplicated = json!({ "image_ids": [&ids[0], &ids[0], &ids[1]] });
        let res = t.send(request(Method::PUT, &uri, Some(duplicated), Some(&cookies))).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_wrong_or_disguised_types() {
        let (t, cookies, vehicle) = setup().await;
        let uri = format!("/api/admin/vehicles/{}/images", vehicle);

        let res = t.send(multipart_request(&uri, &cookies, "text/plain", b"hello", &[])).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(res).await["details"]["field"], "file");

        let res = t.send(multipart_request(&uri, &cookies, "image/png", JPEG_BYTES, &[])).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = t.send(multipart_request(&uri, &cookies, "image/jpeg", JPEG_BYTES, &[])).await;
        assert_eq!(res.status(), StatusCode::CREATED);
        assert!(body_json(res).await["url"].as_str().unwrap().ends_with(".jpg"));

        let res = t.send(multipart_request(&uri, &cookies, "image/png", b"", &[])).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_image_is_rejected() {
        let t = TestApp::with_config(|c| c.storage.max_image_bytes = 8).await;
        let cookies = t.login_admin().await;
        let vehicle = seed_vehicle(&t.state, "Honda", "Civic", 2020, 2_000_000, 1_000, "available", false).await;

        let uri = format!("/api/admin/vehicles/{}/images", vehicle);
        let res = t.send(multipart_request(&uri, &cookies, "image/png", PNG_BYTES, &[])).await;
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(list(&t, &cookies, &vehicle).await.is_empty());
    }

    #[tokio::test]
    async fn uploads_require_live_vehicle() {
        let (t, cookies, vehicle) = setup().await;
        sqlx::query("UPDATE vehicles SET deleted_at = '2024-01-01T00:00:00Z' WHERE id = ?1")
            .bind(&vehicle)
            .execute(&t.state.db)
            .await
            .unwrap();
        let uri = format!("/api/admin/vehicles/{}/images", vehicle);
        let res = t.send(multipart_request(&uri, &cookies, "image/png", PNG_BYTES, &[])).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stored_images_are_served_with_long_cache() {
        let (t, cookies, vehicle) = setup().await;
        let image = upload(&t, &cookies, &vehicle, &[]).await;

        let res = t.get(image["url"].as_str().unwrap(), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(res.headers()[header::CACHE_CONTROL], "public, max-age=31536000, immutable");
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], PNG_BYTES);
    }

    #[tokio::test]
    async fn catalog_exposes_primary_image() {
        let (t, cookies, vehicle) = setup().await;
        let primary = upload(&t, &cookies, &vehicle, &[]).await;
        upload(&t, &cookies, &vehicle, &[]).await;

        let page = body_json(t.get("/api/vehicles", None).await).await;
        assert_eq!(page["items"][0]["primary_image_url"], primary["url"]);

        let detail = body_json(t.get(&format!("/api/vehicles/{}", vehicle), None).await).await;
        let images = detail["images"].as_array().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0]["id"], primary["id"]);
        assert!(images[0].get("storage_path").is_none());
    }
}
