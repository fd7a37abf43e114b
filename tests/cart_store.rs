use std::sync::Arc;

use rust_decimal_macros::dec;
use sea_orm::DatabaseConnection;
use storefront_api::{
    db::{establish_connection, run_migrations},
    entities::{cart_item::SellerOffer, AddressSnapshot},
    events::EventSender,
    services::carts::{CartError, CartItemInput, CartService},
    services::orders::OrderService,
};
use tokio::sync::mpsc;
use uuid::Uuid;

async fn test_db() -> Arc<DatabaseConnection> {
    let pool = establish_connection("sqlite::memory:")
        .await
        .expect("sqlite connection");
    run_migrations(&pool).await.expect("migrations");
    Arc::new(pool)
}

async fn cart_service() -> CartService {
    let (tx, mut rx) = mpsc::channel(16);
    // Drain events so the channel never fills up during a test
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    CartService::new(test_db().await, Arc::new(EventSender::new(tx)))
}

fn item_input(gtin: &str, seller: &str, quantity: i32) -> CartItemInput {
    CartItemInput {
        gtin: gtin.into(),
        name: format!("Product {}", gtin),
        image_url: None,
        brand: None,
        category: None,
        unit: None,
        offer: SellerOffer {
            qid: Some(format!("offer-{}-{}", gtin, seller)),
            seller: seller.into(),
            price: dec!(12.50),
            currency: Some("EUR".into()),
            quantity_purchase: quantity,
            inventory: Some(100),
            mov: None,
            mov_currency: None,
        },
    }
}

fn purchased_total(detail: &storefront_api::services::carts::CartDetail) -> i32 {
    detail
        .items
        .iter()
        .flat_map(|i| i.seller_offers.iter())
        .map(|o| o.quantity_purchase)
        .sum()
}

#[tokio::test]
async fn total_items_tracks_every_mutation() {
    let service = cart_service().await;
    let user_id = Uuid::new_v4();

    let detail = service
        .add_item(user_id, item_input("4006381333931", "acme", 2))
        .await
        .expect("add first offer");
    assert_eq!(detail.cart.total_items, 2);

    // Second seller on the same GTIN stays on one line
    let detail = service
        .add_item(user_id, item_input("4006381333931", "globex", 3))
        .await
        .expect("add second offer");
    assert_eq!(detail.items.len(), 1);
    assert_eq!(detail.cart.total_items, 5);
    assert_eq!(detail.cart.total_items, purchased_total(&detail));

    let detail = service
        .add_item(user_id, item_input("5000112637922", "acme", 1))
        .await
        .expect("add second line");
    assert_eq!(detail.items.len(), 2);
    assert_eq!(detail.cart.total_items, 6);

    let item_id = detail.items[0].id;
    let detail = service
        .update_item_quantity(user_id, item_id, "acme", 7)
        .await
        .expect("update quantity");
    assert_eq!(detail.cart.total_items, 11);
    assert_eq!(detail.cart.total_items, purchased_total(&detail));

    let detail = service
        .remove_item(user_id, item_id, Some("globex"))
        .await
        .expect("remove one offer");
    assert_eq!(detail.cart.total_items, 8);
    assert_eq!(detail.cart.total_items, purchased_total(&detail));

    let detail = service.clear_cart(user_id).await.expect("clear");
    assert!(detail.items.is_empty());
    assert_eq!(detail.cart.total_items, 0);
}

#[tokio::test]
async fn same_seller_offer_merges_instead_of_duplicating() {
    let service = cart_service().await;
    let user_id = Uuid::new_v4();

    service
        .add_item(user_id, item_input("4006381333931", "acme", 2))
        .await
        .expect("first add");
    let detail = service
        .add_item(user_id, item_input("4006381333931", "acme", 3))
        .await
        .expect("second add");

    assert_eq!(detail.items.len(), 1);
    let offers = &detail.items[0].seller_offers;
    assert_eq!(offers.iter().count(), 1);
    assert_eq!(offers.iter().next().unwrap().quantity_purchase, 5);
    assert_eq!(detail.cart.total_items, 5);
}

#[tokio::test]
async fn updating_unknown_item_reports_item_not_found() {
    let service = cart_service().await;
    let user_id = Uuid::new_v4();
    let missing = Uuid::new_v4();

    let err = service
        .update_item_quantity(user_id, missing, "acme", 1)
        .await
        .expect_err("unknown item");
    assert!(matches!(err, CartError::ItemNotFound(id) if id == missing));
}

#[tokio::test]
async fn updating_unknown_seller_reports_offer_not_found() {
    let service = cart_service().await;
    let user_id = Uuid::new_v4();

    let detail = service
        .add_item(user_id, item_input("4006381333931", "acme", 2))
        .await
        .expect("add");
    let item_id = detail.items[0].id;

    let err = service
        .update_item_quantity(user_id, item_id, "globex", 1)
        .await
        .expect_err("unknown seller");
    assert!(
        matches!(err, CartError::OfferNotFound { item_id: id, ref seller } if id == item_id && seller == "globex")
    );
}

#[tokio::test]
async fn item_from_another_users_cart_is_not_reachable() {
    let service = cart_service().await;
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();

    let detail = service
        .add_item(owner, item_input("4006381333931", "acme", 2))
        .await
        .expect("add");
    let item_id = detail.items[0].id;

    let err = service
        .update_item_quantity(stranger, item_id, "acme", 9)
        .await
        .expect_err("foreign item");
    assert!(matches!(err, CartError::ItemNotFound(_)));
}

#[tokio::test]
async fn checkout_snapshot_preserves_offer_fields() {
    let db = test_db().await;
    let (tx, mut rx) = mpsc::channel(16);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let sender = Arc::new(EventSender::new(tx));
    let carts = CartService::new(db.clone(), sender.clone());
    let orders = OrderService::new(db, sender, "EUR".into());

    let user_id = Uuid::new_v4();
    let mut input = item_input("4006381333931", "acme", 2);
    input.offer.mov = Some(dec!(250));
    input.offer.mov_currency = Some("EUR".into());
    input.offer.inventory = Some(40);
    let cart = carts.add_item(user_id, input).await.expect("add");

    let order = orders
        .create_order_from_cart(
            user_id,
            &cart,
            AddressSnapshot {
                full_name: "Ada Lovelace".into(),
                email: "ada@example.com".into(),
                phone: None,
                line1: "1 Analytical Way".into(),
                line2: None,
                city: "London".into(),
                state: None,
                postal_code: "N1 9GU".into(),
                country: "GB".into(),
            },
            None,
        )
        .await
        .expect("checkout");

    let snapshot = order.items[0].seller_data.as_ref().expect("seller data");
    assert_eq!(snapshot.qid.as_deref(), Some("offer-4006381333931-acme"));
    assert_eq!(snapshot.mov, Some(dec!(250)));
    assert_eq!(snapshot.mov_currency.as_deref(), Some("EUR"));
    assert_eq!(snapshot.inventory, Some(40));
}

#[tokio::test]
async fn removing_last_offer_deletes_the_line() {
    let service = cart_service().await;
    let user_id = Uuid::new_v4();

    let detail = service
        .add_item(user_id, item_input("4006381333931", "acme", 2))
        .await
        .expect("add");
    let item_id = detail.items[0].id;

    let detail = service
        .remove_item(user_id, item_id, Some("acme"))
        .await
        .expect("remove last offer");
    assert!(detail.items.is_empty());
    assert_eq!(detail.cart.total_items, 0);
}
