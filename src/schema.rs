diesel::table! {
    omd.trino_queries_history (query_id) {
        query_id -> Varchar,
        state -> Nullable<Varchar>,
        user -> Nullable<Varchar>,
        source -> Nullable<Varchar>,
        query -> Nullable<Varchar>,
        resource_group_id -> Nullable<Array<Text>>,
        queued_time_ms -> Nullable<Int8>,
        analysis_time_ms -> Nullable<Int8>,
        planning_time_ms -> Nullable<Int8>,
        created -> Nullable<Timestamptz>,
        started -> Nullable<Timestamptz>,
        last_heartbeat -> Nullable<Timestamptz>,
        #[sql_name = "end"]
        end_time -> Nullable<Timestamptz>,
        error_type -> Nullable<Varchar>,
        error_code -> Nullable<Varchar>,
    }
}

diesel::table! {
    omd.trino_query_objects (id) {
        id -> Int4,
        name -> Varchar,
    }
}

diesel::table! {
    omd.trino_queries_and_query_objects_lnk (object_id, query_id) {
        object_id -> Int4,
        query_id -> Varchar,
    }
}

diesel::joinable!(trino_queries_and_query_objects_lnk -> trino_query_objects (object_id));
diesel::joinable!(trino_queries_and_query_objects_lnk -> trino_queries_history (query_id));

diesel::allow_tables_to_appear_in_same_query!(
    trino_queries_history,
    trino_query_objects,
    trino_queries_and_query_objects_lnk,
);
