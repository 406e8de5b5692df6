//! Resolves federated queries through the public API.
//!
//! The first fixture loads `me` from an accounts subgraph and its reviews as entities of
//! a reviews subgraph. The second one adds the products of those reviews, loaded from a
//! products subgraph.

use std::num::NonZeroU64;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use graphql_resolve::Context;
use graphql_resolve::GraphQLResponse;
use graphql_resolve::Resolver;
use graphql_resolve::ResolverConfig;
use graphql_resolve::cache::CacheKeyTemplate;
use graphql_resolve::cache::FetchCacheConfiguration;
use graphql_resolve::configuration::L2CacheConfig;
use graphql_resolve::plan::Array;
use graphql_resolve::plan::BatchEntityFetch;
use graphql_resolve::plan::BatchInput;
use graphql_resolve::plan::DataSource;
use graphql_resolve::plan::Fetch;
use graphql_resolve::plan::FetchConfiguration;
use graphql_resolve::plan::FetchInfo;
use graphql_resolve::plan::Field;
use graphql_resolve::plan::FieldInfo;
use graphql_resolve::plan::GraphCoordinate;
use graphql_resolve::plan::Node;
use graphql_resolve::plan::Object;
use graphql_resolve::plan::PostProcessing;
use graphql_resolve::plan::Scalar;
use graphql_resolve::plan::SingleFetch;
use graphql_resolve::policy::AuthorizationDeny;
use graphql_resolve::policy::Authorizer;
use graphql_resolve::policy::RateLimitDeny;
use graphql_resolve::policy::RateLimiter;
use graphql_resolve::policy::WindowRateLimiter;
use graphql_resolve::template::GraphQlResolveRenderer;
use graphql_resolve::template::InputTemplate;
use graphql_resolve::template::TemplateSegment;
use graphql_resolve::template::Variable;
use http::HeaderMap;
use parking_lot::Mutex;
use test_log::test;
use tower::BoxError;

const FULL_RESPONSE: &str =
    r#"{"data":{"me":{"id":"1234","username":"Me","reviews":[{"body":"A highly effective form of birth control."}]}}}"#;

struct Subgraph {
    response: &'static str,
    calls: AtomicUsize,
}

impl Subgraph {
    fn new(response: &'static str) -> Arc<Self> {
        Arc::new(Self {
            response,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for Subgraph {
    async fn load(&self, _headers: &HeaderMap, _input: Bytes) -> Result<Bytes, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from_static(self.response.as_bytes()))
    }
}

/// Denies the listed coordinates and records every decision it is asked for.
#[derive(Default)]
struct DenyList {
    denied: Vec<(&'static str, &'static str)>,
    asked: Mutex<Vec<String>>,
}

impl DenyList {
    fn new(denied: Vec<(&'static str, &'static str)>) -> Arc<Self> {
        Arc::new(Self {
            denied,
            asked: Mutex::default(),
        })
    }

    fn decide(&self, coordinate: &GraphCoordinate) -> Option<AuthorizationDeny> {
        self.asked
            .lock()
            .push(format!("{}.{}", coordinate.type_name, coordinate.field_name));
        self.denied
            .iter()
            .any(|(type_name, field_name)| {
                coordinate.type_name == *type_name && coordinate.field_name == *field_name
            })
            .then(|| AuthorizationDeny::new("not allowed"))
    }

    fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }
}

impl Authorizer for DenyList {
    fn authorize_pre_fetch(
        &self,
        _ctx: &Context,
        _data_source_id: &str,
        _input: &[u8],
        coordinate: &GraphCoordinate,
    ) -> Result<Option<AuthorizationDeny>, BoxError> {
        Ok(self.decide(coordinate))
    }

    fn authorize_object_field(
        &self,
        _ctx: &Context,
        _data_source_id: &str,
        _object: &[u8],
        coordinate: &GraphCoordinate,
    ) -> Result<Option<AuthorizationDeny>, BoxError> {
        Ok(self.decide(coordinate))
    }
}

struct Subgraphs {
    accounts: Arc<Subgraph>,
    reviews: Arc<Subgraph>,
}

impl Subgraphs {
    fn new() -> Self {
        Self {
            accounts: Subgraph::new(r#"{"data":{"me":{"__typename":"User","id":"1234","username":"Me"}}}"#),
            reviews: Subgraph::new(
                r#"{"data":{"_entities":[{"__typename":"User","reviews":[{"body":"A highly effective form of birth control."}]}]}}"#,
            ),
        }
    }

    /// `{ me { id username reviews { body } } }`
    fn response(&self, caching: Option<FetchCacheConfiguration>) -> GraphQLResponse {
        let accounts = Fetch::single(SingleFetch {
            input: InputTemplate::new(vec![TemplateSegment::text(
                r#"{"method":"POST","url":"http://accounts","body":{"query":"{me {__typename id username}}"}}"#,
            )]),
            config: FetchConfiguration::builder()
                .data_source(self.accounts.clone() as Arc<dyn DataSource>)
                .post_processing(PostProcessing::data_and_errors(["data"]))
                .info(FetchInfo::new(
                    "accounts",
                    vec![GraphCoordinate::new("Query", "me").with_authorization_rule()],
                ))
                .build(),
        });

        let mut reviews_config = FetchConfiguration::builder()
            .data_source(self.reviews.clone() as Arc<dyn DataSource>)
            .post_processing(PostProcessing::data_and_errors(["data", "_entities"]))
            .info(FetchInfo::new(
                "reviews",
                vec![GraphCoordinate::new("User", "reviews").with_authorization_rule()],
            ))
            .build();
        if let Some(caching) = caching {
            reviews_config.caching = caching;
        }
        let reviews = Fetch::BatchEntity(Box::new(BatchEntityFetch {
            input: BatchInput {
                header: InputTemplate::new(vec![TemplateSegment::text(
                    r#"{"method":"POST","url":"http://reviews","body":{"query":"query($representations: [_Any!]!){_entities(representations: $representations){... on User {reviews {body}}}}","variables":{"representations":["#,
                )]),
                items: vec![InputTemplate::new(vec![TemplateSegment::Variable(
                    Variable::ResolvableObject {
                        renderer: Arc::new(GraphQlResolveRenderer::new(user_key())),
                    },
                )])],
                skip_null_items: true,
                skip_empty_object_items: true,
                skip_err_items: true,
                separator: InputTemplate::new(vec![TemplateSegment::text(",")]),
                footer: InputTemplate::new(vec![TemplateSegment::text("]}}}")]),
            },
            config: reviews_config,
        }));

        let me = Object::new(vec![
            string("id"),
            string("username").with_info(FieldInfo::authorized("User", "accounts")),
            Field::new(
                "reviews",
                Array::new(Object::new(vec![string("body")])).at(["reviews"]).nullable(),
            ),
        ])
        .at(["me"])
        .nullable()
        .with_type_name("User")
        .with_fetch(reviews);

        GraphQLResponse::new(Object::new(vec![Field::new("me", me)]).with_fetch(accounts))
    }
}

fn string(name: &str) -> Field {
    Field::new(name, Node::String(Scalar::at([name])))
}

fn user_key() -> Object {
    Object::new(vec![string("__typename"), string("id")])
}

async fn resolve(resolver: &Resolver, ctx: &Context, response: &GraphQLResponse) -> String {
    let mut out = Vec::new();
    resolver
        .resolve_graphql_response(ctx, response, None, &mut out)
        .await
        .unwrap();
    String::from_utf8(out).unwrap()
}

#[test(tokio::test)]
async fn resolves_across_subgraphs() {
    let resolver = Resolver::new(ResolverConfig::default());
    let subgraphs = Subgraphs::new();
    let ctx = resolver.new_context();

    let out = resolve(&resolver, &ctx, &subgraphs.response(None)).await;

    assert_eq!(out, FULL_RESPONSE);
    assert_eq!((subgraphs.accounts.calls(), subgraphs.reviews.calls()), (1, 1));
}

#[test(tokio::test)]
async fn allowing_authorizer_is_asked_once_per_rule() {
    let resolver = Resolver::new(ResolverConfig::default());
    let subgraphs = Subgraphs::new();
    let authorizer = DenyList::new(Vec::new());
    let ctx = resolver.new_context().with_authorizer(authorizer.clone());

    let out = resolve(&resolver, &ctx, &subgraphs.response(None)).await;

    assert_eq!(out, FULL_RESPONSE);
    assert_eq!(authorizer.asked(), vec!["Query.me", "User.reviews", "User.username"]);
}

#[test(tokio::test)]
async fn denied_child_fetch_leaves_null() {
    let resolver = Resolver::new(ResolverConfig::default());
    let subgraphs = Subgraphs::new();
    let ctx = resolver
        .new_context()
        .with_authorizer(DenyList::new(vec![("User", "reviews")]));

    let out = resolve(&resolver, &ctx, &subgraphs.response(None)).await;

    insta::assert_snapshot!(out, @r#"{"errors":[{"message":"Unauthorized request to Subgraph 'reviews' at path 'query.me'. Reason: not allowed."}],"data":{"me":{"id":"1234","username":"Me","reviews":null}}}"#);
    assert_eq!(subgraphs.reviews.calls(), 0);
}

#[test(tokio::test)]
async fn denied_non_null_field_nulls_its_parent() {
    let resolver = Resolver::new(ResolverConfig::default());
    let subgraphs = Subgraphs::new();
    let ctx = resolver
        .new_context()
        .with_authorizer(DenyList::new(vec![("User", "username")]));

    let out = resolve(&resolver, &ctx, &subgraphs.response(None)).await;

    insta::assert_snapshot!(out, @r#"{"errors":[{"message":"Unauthorized to load field 'Query.me.username'. Reason: not allowed","path":["me","username"]}],"data":{"me":null}}"#);
}

#[test(tokio::test)]
async fn denied_root_fetch_has_no_data() {
    let resolver = Resolver::new(ResolverConfig::default());
    let subgraphs = Subgraphs::new();
    let ctx = resolver
        .new_context()
        .with_authorizer(DenyList::new(vec![("Query", "me")]));

    let out = resolve(&resolver, &ctx, &subgraphs.response(None)).await;

    insta::assert_snapshot!(out, @r#"{"errors":[{"message":"Unauthorized request to Subgraph 'accounts' at path 'query'. Reason: not allowed."}],"data":null}"#);
    assert_eq!((subgraphs.accounts.calls(), subgraphs.reviews.calls()), (0, 0));
}

#[test(tokio::test)]
async fn rate_limit_applies_per_subgraph() {
    let resolver = Resolver::new(ResolverConfig::default());
    let subgraphs = Subgraphs::new();
    let limiter = Arc::new(WindowRateLimiter::new(
        NonZeroU64::new(1).unwrap(),
        Duration::from_secs(3600),
    ));
    let response = subgraphs.response(None);

    let ctx = resolver.new_context().with_rate_limiter(limiter.clone());
    assert_eq!(resolve(&resolver, &ctx, &response).await, FULL_RESPONSE);

    let ctx = resolver.new_context().with_rate_limiter(limiter);
    let out = resolve(&resolver, &ctx, &response).await;
    insta::assert_snapshot!(out, @r#"{"errors":[{"message":"Rate limit exceeded for Subgraph 'accounts' at Path 'query', Reason: rate limit exceeded."}],"data":null}"#);
    assert_eq!((subgraphs.accounts.calls(), subgraphs.reviews.calls()), (1, 1));
}

#[test(tokio::test)]
async fn l2_cache_serves_repeated_entities() {
    let resolver = Resolver::new(ResolverConfig {
        l2_cache: Some(L2CacheConfig {
            name: "entities".to_string(),
            capacity: NonZeroUsize::new(16).unwrap(),
            default_ttl: Some(Duration::from_secs(60)),
        }),
        ..ResolverConfig::default()
    });
    let subgraphs = Subgraphs::new();
    let response = subgraphs.response(Some(FetchCacheConfiguration::new(
        "entities",
        CacheKeyTemplate::Entity { keys: user_key() },
    )));

    for _ in 0..2 {
        let mut ctx = resolver.new_context();
        ctx.execution_options.caching.enable_l2 = true;
        assert_eq!(resolve(&resolver, &ctx, &response).await, FULL_RESPONSE);
        let stats = ctx.stats();
        assert_eq!(stats.resolved_objects, 3);
    }
    assert_eq!((subgraphs.accounts.calls(), subgraphs.reviews.calls()), (2, 1));
}

/// `{ me { id username reviews { product { data { name } } } } }` across users, reviews
/// and products.
struct ProductReviews {
    users: Arc<Subgraph>,
    reviews: Arc<Subgraph>,
    products: Arc<Subgraph>,
}

impl ProductReviews {
    fn new() -> Self {
        Self {
            users: Subgraph::new(r#"{"data":{"me":{"__typename":"User","id":"1234","username":"Me"}}}"#),
            reviews: Subgraph::new(
                r#"{"data":{"_entities":[{"__typename":"User","reviews":[{"body":"A highly effective form of birth control.","product":{"__typename":"Product","upc":"top-1"}},{"body":"Fedoras are one of the most fashionable hats around and can look great with a variety of outfits.","product":{"__typename":"Product","upc":"top-2"}}]}]}}"#,
            ),
            products: Subgraph::new(r#"{"data":{"_entities":[{"name":"Trilby"},{"name":"Fedora"}]}}"#),
        }
    }

    fn response(&self) -> GraphQLResponse {
        let users = Fetch::single(SingleFetch {
            input: InputTemplate::new(vec![TemplateSegment::text(
                r#"{"method":"POST","url":"http://users","body":{"query":"{me {id username}}"}}"#,
            )]),
            config: config(
                "users",
                self.users.clone(),
                PostProcessing::data_and_errors(["data"]),
                vec![GraphCoordinate::new("Query", "me").with_authorization_rule()],
            ),
        });
        let reviews = entity_fetch(
            "reviews",
            Object::new(vec![string("__typename"), string("id")]),
            config(
                "reviews",
                self.reviews.clone(),
                PostProcessing::data_and_errors(["data", "_entities"]),
                vec![GraphCoordinate::new("User", "reviews")],
            ),
        );
        let products = entity_fetch(
            "products",
            Object::new(vec![string("__typename"), string("upc")]),
            config(
                "products",
                self.products.clone(),
                PostProcessing::data_and_errors(["data", "_entities"]).with_merge_path(["data"]),
                vec![GraphCoordinate::new("Product", "name").with_authorization_rule()],
            ),
        );

        let product = Object::new(vec![Field::new(
            "data",
            Object::new(vec![
                string("name").with_info(FieldInfo::authorized("Product", "products")),
            ])
            .at(["data"]),
        )])
        .at(["product"])
        .with_type_name("Product")
        .with_fetch(products);
        let review = Object::new(vec![
            Field::new("product", product).with_info(FieldInfo::authorized("Review", "reviews")),
        ])
        .nullable()
        .with_type_name("Review");
        let me = Object::new(vec![
            string("id"),
            string("username"),
            Field::new("reviews", Array::new(review).at(["reviews"]).nullable())
                .with_info(FieldInfo::authorized("User", "reviews")),
        ])
        .at(["me"])
        .nullable()
        .with_type_name("User")
        .with_fetch(reviews);

        GraphQLResponse::new(Object::new(vec![Field::new("me", me)]).with_fetch(users))
    }
}

fn config(
    name: &str,
    data_source: Arc<Subgraph>,
    post_processing: PostProcessing,
    root_fields: Vec<GraphCoordinate>,
) -> FetchConfiguration {
    FetchConfiguration::builder()
        .data_source(data_source as Arc<dyn DataSource>)
        .post_processing(post_processing)
        .info(FetchInfo::new(name, root_fields))
        .build()
}

fn entity_fetch(url: &str, key: Object, config: FetchConfiguration) -> Fetch {
    Fetch::BatchEntity(Box::new(BatchEntityFetch {
        input: BatchInput {
            header: InputTemplate::new(vec![TemplateSegment::text(format!(
                r#"{{"method":"POST","url":"http://{url}","body":{{"variables":{{"representations":["#
            ))]),
            items: vec![InputTemplate::new(vec![TemplateSegment::Variable(
                Variable::ResolvableObject {
                    renderer: Arc::new(GraphQlResolveRenderer::new(key)),
                },
            )])],
            skip_null_items: true,
            skip_empty_object_items: true,
            skip_err_items: true,
            separator: InputTemplate::new(vec![TemplateSegment::text(",")]),
            footer: InputTemplate::new(vec![TemplateSegment::text("]}}}")]),
        },
        config,
    }))
}

/// Allows every fetch and denies the product name field.
#[derive(Default)]
struct ProductNameAuthorizer {
    calls: AtomicUsize,
}

impl Authorizer for ProductNameAuthorizer {
    fn authorize_pre_fetch(
        &self,
        _ctx: &Context,
        _data_source_id: &str,
        _input: &[u8],
        _coordinate: &GraphCoordinate,
    ) -> Result<Option<AuthorizationDeny>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn authorize_object_field(
        &self,
        _ctx: &Context,
        _data_source_id: &str,
        _object: &[u8],
        coordinate: &GraphCoordinate,
    ) -> Result<Option<AuthorizationDeny>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((coordinate.type_name == "Product" && coordinate.field_name == "name")
            .then(|| AuthorizationDeny::new("Not allowed to fetch name on Product")))
    }
}

/// Denies every request to the products subgraph.
#[derive(Default)]
struct ProductsRateLimiter {
    calls: AtomicUsize,
}

impl RateLimiter for ProductsRateLimiter {
    fn rate_limit_pre_fetch<'a>(
        &self,
        _ctx: &Context,
        info: Option<&'a FetchInfo>,
        _input: &[u8],
    ) -> Result<Option<RateLimitDeny>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(info
            .filter(|info| info.data_source_id == "products")
            .map(|_| RateLimitDeny::new("rate limit exceeded")))
    }
}

#[test(tokio::test)]
async fn resolves_products_of_reviews() {
    let resolver = Resolver::new(ResolverConfig::default());
    let subgraphs = ProductReviews::new();

    let out = resolve(&resolver, &resolver.new_context(), &subgraphs.response()).await;

    insta::assert_snapshot!(out, @r#"{"data":{"me":{"id":"1234","username":"Me","reviews":[{"product":{"data":{"name":"Trilby"}}},{"product":{"data":{"name":"Fedora"}}}]}}}"#);
    assert_eq!(subgraphs.products.calls(), 1);
}

#[test(tokio::test)]
async fn denied_product_name_nulls_each_review() {
    let resolver = Resolver::new(ResolverConfig::default());
    let subgraphs = ProductReviews::new();
    let authorizer = Arc::new(ProductNameAuthorizer::default());
    let ctx = resolver.new_context().with_authorizer(authorizer.clone());

    let out = resolve(&resolver, &ctx, &subgraphs.response()).await;

    assert_eq!(
        out,
        r#"{"errors":[{"message":"Unauthorized to load field 'Query.me.reviews.product.data.name'. Reason: Not allowed to fetch name on Product","path":["me","reviews",0,"product","data","name"]},{"message":"Unauthorized to load field 'Query.me.reviews.product.data.name'. Reason: Not allowed to fetch name on Product","path":["me","reviews",1,"product","data","name"]}],"data":{"me":{"id":"1234","username":"Me","reviews":[null,null]}}}"#
    );
    assert_eq!(authorizer.calls.load(Ordering::SeqCst), 5);
}

#[test(tokio::test)]
async fn rate_limited_products_null_each_review() {
    let resolver = Resolver::new(ResolverConfig::default());
    let subgraphs = ProductReviews::new();
    let rate_limiter = Arc::new(ProductsRateLimiter::default());
    let ctx = resolver.new_context().with_rate_limiter(rate_limiter.clone());

    let out = resolve(&resolver, &ctx, &subgraphs.response()).await;

    assert_eq!(
        out,
        r#"{"errors":[{"message":"Rate limit exceeded for Subgraph 'products' at Path 'query.me.reviews.@.product', Reason: rate limit exceeded."}],"data":{"me":{"id":"1234","username":"Me","reviews":[null,null]}}}"#
    );
    assert_eq!(rate_limiter.calls.load(Ordering::SeqCst), 3);
    assert_eq!(subgraphs.products.calls(), 0);
}
